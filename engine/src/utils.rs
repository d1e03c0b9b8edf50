//! Helpers shared by the worker threads.

use std::any::Any;

/// Renders the payload of a caught panic for logging.
pub(crate) fn panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_panic_message_variants() {
        let err = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "static");

        let value = 7;
        let err = catch_unwind(|| panic!("formatted {value}")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "formatted 7");

        let err = catch_unwind(|| std::panic::panic_any(42u32)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "non-string panic payload");
    }
}

//! Shared error plumbing for the autoflow crates.
//!
//! Each crate owns its error enums; this module only fixes the `Result`
//! alias used at crate boundaries so callers can attach context to a
//! `rootcause::Report` as failures move outward.

use rootcause::Report;

/// Result alias carrying a `rootcause::Report` with context type `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn ok_values_pass_through() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.expect("should be ok"), 7);
    }

    #[test]
    fn report_wraps_context() {
        let failed: Result<u32, Boom> = Err(Boom.into());
        let err = failed.expect_err("should be an error");
        assert!(err.to_string().contains("boom"));
    }
}

//! Escalation of non-recoverable errors.

/// Abort the process on errors which have no local recovery path, rendering
/// the full error chain first.
pub trait PagecountFatal<T, E>: Sized + sealed::Sealed {
    /// Abort the computation as gracefully as possible due to a fatal
    /// non-recoverable error.
    fn pagecount_fatal(self) -> T;
}

impl<T, E> PagecountFatal<T, E> for Result<T, E>
where
    E: std::fmt::Debug + std::error::Error + Send + Sync + 'static,
{
    fn pagecount_fatal(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => {
                let report = eyre::Report::new(e);
                panic!("{report:?}")
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

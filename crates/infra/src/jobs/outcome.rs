//! What a job invocation tells its caller.

/// A job's own report maps to a process exit code.
pub trait JobReport {
    fn exit_code(&self) -> i32;

    /// Exit code when the guarded region failed unexpectedly.
    const CRASH_EXIT_CODE: i32 = 1;
}

#[derive(Debug)]
pub enum JobOutcome<R> {
    /// Another invocation holds the job lock; nothing was done.
    AlreadyRunning,
    /// A required backend or capability is missing; nothing was done.
    NotReady(String),
    Finished(R),
    /// An unexpected error or panic interrupted the guarded region.
    Crashed(String),
}

impl<R: JobReport> JobOutcome<R> {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::AlreadyRunning => 0,
            JobOutcome::NotReady(_) => 1,
            JobOutcome::Finished(report) => report.exit_code(),
            JobOutcome::Crashed(_) => R::CRASH_EXIT_CODE,
        }
    }

    pub fn report(&self) -> Option<&R> {
        match self {
            JobOutcome::Finished(report) => Some(report),
            _ => None,
        }
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Report(i32);

    impl JobReport for Report {
        fn exit_code(&self) -> i32 {
            self.0
        }
    }

    struct Lenient;

    impl JobReport for Lenient {
        fn exit_code(&self) -> i32 {
            0
        }

        const CRASH_EXIT_CODE: i32 = 0;
    }

    #[test]
    fn lock_contention_is_not_a_failure() {
        assert_eq!(JobOutcome::<Report>::AlreadyRunning.exit_code(), 0);
        assert_eq!(JobOutcome::Finished(Report(7)).exit_code(), 7);
        assert_eq!(JobOutcome::<Report>::NotReady("imap".into()).exit_code(), 1);
        assert_eq!(JobOutcome::<Report>::Crashed("boom".into()).exit_code(), 1);
        assert_eq!(JobOutcome::<Lenient>::Crashed("boom".into()).exit_code(), 0);
    }

    #[test]
    fn panic_payloads_render() {
        let caught = std::panic::catch_unwind(|| panic!("bad {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "bad 1");
    }
}

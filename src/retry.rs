use std::io;
use tracing::warn;


/// Why a read produced no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// The stream reported end-of-stream.
    EndOfStream,
    /// A read error that may clear up after re-acquiring the handle.
    Transient,
    /// The device is gone; retrying cannot help.
    Fatal,
}

impl ReadFailure {
    /// Classify a read error by what it says about the device.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => return ReadFailure::Fatal,
            _ => {}
        }
        match err.raw_os_error() {
            Some(code) if device_gone(code) => ReadFailure::Fatal,
            _ => ReadFailure::Transient,
        }
    }
}

/// Errors a tty reports once its device has been unplugged.
#[cfg(unix)]
fn device_gone(code: i32) -> bool {
    use nix::errno::Errno;
    matches!(
        Errno::from_raw(code),
        Errno::EIO | Errno::ENXIO | Errno::EBADF | Errno::ENODEV
    )
}

#[cfg(not(unix))]
fn device_gone(_code: i32) -> bool {
    false
}

/// Decision returned by the retry policy after a failed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the read handle, pause, and re-acquire (includes 1-based attempt number).
    Retry { attempt: u32 },
    /// Stop reading and tear the connection down.
    GiveUp,
}

/// Bounded retry policy for the read loop.
///
/// Counts consecutive failed reads; a read that yields data resets the count.
/// A stream that keeps failing is abandoned after `max_retries` attempts.
pub struct ReadRetryPolicy {
    max_retries: u32,
    current_attempt: u32,
}

impl ReadRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            current_attempt: 0,
        }
    }

    /// Evaluate a failed read and decide what to do next.
    pub fn evaluate(&mut self, failure: ReadFailure) -> RetryDecision {
        if failure == ReadFailure::Fatal {
            warn!("device no longer readable, giving up");
            return RetryDecision::GiveUp;
        }

        self.current_attempt += 1;

        if self.current_attempt <= self.max_retries {
            warn!(
                ?failure,
                attempt = self.current_attempt,
                max_retries = self.max_retries,
                "read failed, re-acquiring read handle"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
            }
        } else {
            warn!(
                ?failure,
                max_retries = self.max_retries,
                "read retries exhausted"
            );
            RetryDecision::GiveUp
        }
    }

    /// A read delivered data: the stream is healthy again.
    pub fn record_success(&mut self) {
        self.current_attempt = 0;
    }

    /// Current attempt count (0 = no failures since the last good read).
    #[cfg(test)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_failure_retries() {
        let mut policy = ReadRetryPolicy::new(2);
        assert_eq!(
            policy.evaluate(ReadFailure::Transient),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(policy.current_attempt(), 1);
    }

    #[test]
    fn test_end_of_stream_counts_toward_limit() {
        let mut policy = ReadRetryPolicy::new(2);
        assert_eq!(
            policy.evaluate(ReadFailure::EndOfStream),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            policy.evaluate(ReadFailure::EndOfStream),
            RetryDecision::Retry { attempt: 2 }
        );
        assert_eq!(
            policy.evaluate(ReadFailure::EndOfStream),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_fatal_gives_up_immediately() {
        let mut policy = ReadRetryPolicy::new(5);
        assert_eq!(policy.evaluate(ReadFailure::Fatal), RetryDecision::GiveUp);
        assert_eq!(policy.current_attempt(), 0);
    }

    #[test]
    fn test_success_resets_attempt_counter() {
        let mut policy = ReadRetryPolicy::new(1);
        assert_eq!(
            policy.evaluate(ReadFailure::Transient),
            RetryDecision::Retry { attempt: 1 }
        );
        policy.record_success();
        assert_eq!(policy.current_attempt(), 0);
        assert_eq!(
            policy.evaluate(ReadFailure::Transient),
            RetryDecision::Retry { attempt: 1 }
        );
    }

    #[test]
    fn test_zero_max_retries_gives_up_on_first_failure() {
        let mut policy = ReadRetryPolicy::new(0);
        assert_eq!(
            policy.evaluate(ReadFailure::Transient),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_classify_broken_pipe_fatal() {
        assert_eq!(
            ReadFailure::classify(&io::Error::from(io::ErrorKind::BrokenPipe)),
            ReadFailure::Fatal
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_device_gone_errnos() {
        use nix::errno::Errno;
        for errno in [Errno::EIO, Errno::ENXIO, Errno::EBADF, Errno::ENODEV] {
            assert_eq!(
                ReadFailure::classify(&io::Error::from_raw_os_error(errno as i32)),
                ReadFailure::Fatal,
                "{errno}"
            );
        }
        assert_eq!(
            ReadFailure::classify(&io::Error::from_raw_os_error(Errno::EAGAIN as i32)),
            ReadFailure::Transient
        );
    }

    #[test]
    fn test_classify_other_errors_transient() {
        assert_eq!(
            ReadFailure::classify(&io::Error::from(io::ErrorKind::TimedOut)),
            ReadFailure::Transient
        );
        assert_eq!(
            ReadFailure::classify(&io::Error::new(io::ErrorKind::Other, "framing error")),
            ReadFailure::Transient
        );
    }
}

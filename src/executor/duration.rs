//! Run-deadline bookkeeping for one test execution.

use std::time::{Duration, Instant};

use crate::fmf::{self, FmfError};

/// Tracks when a running test is out of time, based on its FMF `duration`.
///
/// Tests adjust the deadline over test control (`set`/`add`/`sub`) and can
/// snapshot remaining time around framework-owned phases with
/// `save`/`restore`; only the outermost save/restore pair takes effect,
/// nested pairs are counted and ignored.
#[derive(Debug)]
pub struct Deadline {
    end: Instant,
    saved: Option<Duration>,
    saved_count: u32,
}

impl Deadline {
    pub fn new(fmf_duration: &str) -> Result<Self, FmfError> {
        let seconds = fmf::duration_to_seconds(fmf_duration)?;
        Ok(Self {
            end: Instant::now() + Duration::from_secs(seconds),
            saved: None,
            saved_count: 0,
        })
    }

    /// The instant the test runs out of time.
    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn set(&mut self, to: &str) -> Result<(), FmfError> {
        self.end = Instant::now() + Duration::from_secs(fmf::duration_to_seconds(to)?);
        Ok(())
    }

    pub fn add(&mut self, by: &str) -> Result<(), FmfError> {
        self.end += Duration::from_secs(fmf::duration_to_seconds(by)?);
        Ok(())
    }

    pub fn sub(&mut self, by: &str) -> Result<(), FmfError> {
        let by = Duration::from_secs(fmf::duration_to_seconds(by)?);
        self.end = self.end.checked_sub(by).unwrap_or_else(Instant::now);
        Ok(())
    }

    pub fn save(&mut self) {
        if self.saved_count == 0 {
            self.saved = Some(self.end.saturating_duration_since(Instant::now()));
        }
        self.saved_count += 1;
    }

    pub fn restore(&mut self) {
        match self.saved_count {
            0 => {}
            1 => {
                if let Some(remaining) = self.saved.take() {
                    self.end = Instant::now() + remaining;
                }
                self.saved_count = 0;
            }
            _ => self.saved_count -= 1,
        }
    }

    pub fn out_of_time(&self) -> bool {
        Instant::now() > self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remaining(deadline: &Deadline) -> Duration {
        deadline.end().saturating_duration_since(Instant::now())
    }

    #[test]
    fn arithmetic_adjusts_the_end() {
        let mut d = Deadline::new("1h").unwrap();
        d.add("30m").unwrap();
        let r = remaining(&d);
        assert!(r > Duration::from_secs(5390) && r <= Duration::from_secs(5400));

        d.sub("1h").unwrap();
        let r = remaining(&d);
        assert!(r > Duration::from_secs(1790) && r <= Duration::from_secs(1800));

        d.set("10s").unwrap();
        let r = remaining(&d);
        assert!(r <= Duration::from_secs(10));
    }

    #[test]
    fn zero_duration_is_immediately_out_of_time() {
        let d = Deadline::new("0").unwrap();
        assert!(d.out_of_time());
        let d = Deadline::new("1h").unwrap();
        assert!(!d.out_of_time());
    }

    #[test]
    fn nested_saves_only_count_the_outermost_pair() {
        let mut d = Deadline::new("1h").unwrap();
        d.save();
        d.save(); // nested, ignored
        d.set("1s").unwrap();
        d.restore(); // nested, ignored
        assert!(remaining(&d) <= Duration::from_secs(1));
        d.restore(); // outermost: back to ~1h
        let r = remaining(&d);
        assert!(r > Duration::from_secs(3590) && r <= Duration::from_secs(3600));

        // balanced pairs leave nothing saved
        assert!(d.saved.is_none());
        assert_eq!(d.saved_count, 0);
    }

    #[test]
    fn restore_without_save_is_a_no_op() {
        let mut d = Deadline::new("30m").unwrap();
        d.restore();
        let r = remaining(&d);
        assert!(r > Duration::from_secs(1790));
    }

    #[test]
    fn bad_duration_strings_are_rejected() {
        assert!(Deadline::new("soon").is_err());
        let mut d = Deadline::new("1m").unwrap();
        assert!(d.add("a while").is_err());
    }
}

use crate::sample::Sample;

/// Result of appending one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Buffer length after the append.
    pub count: usize,
    /// True when `count` crossed a progress boundary.
    pub progress: bool,
}

/// Append-only, intake-ordered store of one session's samples.
#[derive(Debug)]
pub struct CollectionBuffer {
    samples: Vec<Sample>,
    progress_every: usize,
}

impl CollectionBuffer {
    /// `progress_every == 0` disables progress reporting.
    pub fn new(progress_every: usize) -> Self {
        Self {
            samples: Vec::new(),
            progress_every,
        }
    }

    pub fn push(&mut self, sample: Sample) -> Appended {
        self.samples.push(sample);
        let count = self.samples.len();
        Appended {
            count,
            progress: self.progress_every > 0 && count % self.progress_every == 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Milliseconds between the first and last sample timestamps.
    pub fn span_ms(&self) -> i64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_milliseconds(),
            _ => 0,
        }
    }

    /// Previews of the first and last `n` values, comma-joined.
    pub fn preview(&self, n: usize) -> (String, String) {
        let render = |samples: &[Sample]| {
            samples
                .iter()
                .map(|s| s.value.preview())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let head = &self.samples[..n.min(self.samples.len())];
        let tail = &self.samples[self.samples.len().saturating_sub(n)..];
        (render(head), render(tail))
    }
}

use std::{fmt, time::Duration};

/// Min, max and mean of the round-trip samples, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[u64]) -> Option<Self> {
        let min = *samples.iter().min()?;
        let max = *samples.iter().max()?;
        let total: u128 = samples.iter().map(|&sample| u128::from(sample)).sum();
        Some(Self {
            min,
            max,
            mean: total as f64 / samples.len() as f64,
        })
    }
}

/// Outcome of a whole load-test run.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub clients: usize,
    pub elapsed: Duration,
    pub samples: Vec<u64>,
    /// Clients that never saw their own probe within the window.
    pub timeouts: usize,
    /// Clients that failed to connect, send or receive.
    pub failures: usize,
}

impl LoadReport {
    pub fn errors(&self) -> usize {
        self.timeouts + self.failures
    }

    pub fn summary(&self) -> Option<LatencySummary> {
        LatencySummary::from_samples(&self.samples)
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Finished {} clients in {}ms",
            self.clients,
            self.elapsed.as_millis()
        )?;
        write!(
            f,
            "Errors: {} (no reply: {}, transport: {})",
            self.errors(),
            self.timeouts,
            self.failures
        )?;
        if let Some(summary) = self.summary() {
            write!(
                f,
                "\nLatency (us) -> Min: {}, Max: {}, Avg: {:.2}",
                summary.min, summary.max, summary.mean
            )?;
        }
        Ok(())
    }
}

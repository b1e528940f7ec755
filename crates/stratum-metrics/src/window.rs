/// Default number of samples a [`ResponseTimeWindow`] retains.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// Fixed-capacity ring buffer of response times in milliseconds.
///
/// Once full, each new sample overwrites the oldest one, so memory use stays
/// constant no matter how many calls are recorded.
#[derive(Debug, Clone)]
pub struct ResponseTimeWindow {
    samples: Vec<f64>,
    capacity: usize,
    /// Next slot to overwrite once the buffer is full
    next: usize,
}

impl ResponseTimeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn record(&mut self, elapsed_ms: f64) {
        if self.samples.len() < self.capacity {
            self.samples.push(elapsed_ms);
        } else {
            self.samples[self.next] = elapsed_ms;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Arithmetic mean of the retained samples, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }
}

impl Default for ResponseTimeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_mean_is_zero() {
        let window = ResponseTimeWindow::default();
        assert!(window.is_empty());
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.capacity(), DEFAULT_WINDOW_CAPACITY);
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = ResponseTimeWindow::new(100);
        for i in 0..250 {
            window.record(i as f64);
        }
        assert_eq!(window.len(), 100);
    }

    #[test]
    fn test_window_overwrites_oldest() {
        let mut window = ResponseTimeWindow::new(3);
        window.record(1.0);
        window.record(2.0);
        window.record(3.0);
        assert_eq!(window.mean(), 2.0);

        // 1.0 is evicted
        window.record(7.0);
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean(), 4.0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = ResponseTimeWindow::new(0);
        window.record(5.0);
        window.record(9.0);
        assert_eq!(window.len(), 1);
        assert_eq!(window.mean(), 9.0);
    }

    #[test]
    fn test_clear() {
        let mut window = ResponseTimeWindow::new(4);
        window.record(1.0);
        window.clear();
        assert!(window.is_empty());
        window.record(2.0);
        assert_eq!(window.mean(), 2.0);
    }
}

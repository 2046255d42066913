//!
//! Event sequences: the observation side of the HMM.
//!
//! An event summarises a short window of the ionic-current trace as a
//! (mean, stdv, start, length) tuple. Sequences are immutable once
//! loaded; drift correction materialises a corrected copy so the
//! decoders only ever see corrected values.
//!
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// mean current of the window (pA)
    pub mean: f64,
    /// standard deviation of the current within the window
    pub stdv: f64,
    /// start time of the window (s)
    pub start: f64,
    /// duration of the window (s)
    pub length: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSequence {
    events: Vec<Event>,
}

impl EventSequence {
    pub fn new(events: Vec<Event>) -> EventSequence {
        EventSequence { events }
    }
    pub fn len(&self) -> usize {
        self.events.len()
    }
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }
    ///
    /// First `n` events, as an owned training window.
    ///
    pub fn head(&self, n: usize) -> EventSequence {
        EventSequence {
            events: self.events[..n.min(self.events.len())].to_vec(),
        }
    }
    ///
    /// Last `n` events, as an owned training window.
    ///
    pub fn tail(&self, n: usize) -> EventSequence {
        let n = n.min(self.events.len());
        EventSequence {
            events: self.events[self.events.len() - n..].to_vec(),
        }
    }
    ///
    /// Unweighted mean and sample standard deviation of the event means.
    ///
    pub fn mean_stdv(&self) -> (f64, f64) {
        let n = self.events.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let mean = self.events.iter().map(|e| e.mean).sum::<f64>() / n as f64;
        if n < 2 {
            return (mean, 0.0);
        }
        let ss = self
            .events
            .iter()
            .map(|e| {
                let d = e.mean - mean;
                d * d
            })
            .sum::<f64>();
        (mean, (ss / (n - 1) as f64).sqrt())
    }
    ///
    /// Corrected copy with `mean' = mean - drift * start`. Composing two
    /// corrections is the correction by the summed drift.
    ///
    pub fn apply_drift_correction(&self, drift: f64) -> EventSequence {
        EventSequence {
            events: self
                .events
                .iter()
                .map(|e| Event {
                    mean: e.mean - drift * e.start,
                    ..*e
                })
                .collect(),
        }
    }
    ///
    /// Release the event buffer.
    ///
    pub fn clear(&mut self) {
        self.events = Vec::new();
    }
}

impl std::ops::Index<usize> for EventSequence {
    type Output = Event;
    fn index(&self, t: usize) -> &Event {
        &self.events[t]
    }
}

impl FromIterator<Event> for EventSequence {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        EventSequence {
            events: iter.into_iter().collect(),
        }
    }
}

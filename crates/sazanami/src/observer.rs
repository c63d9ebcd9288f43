use tokio::sync::watch;

use crate::buffer::BufferedRanges;

/// A sample of the state of the player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackObservation {
    pub position: f64,
    pub buffered: BufferedRanges,
    pub speed: f64,
    pub rebuffering: bool,
}

impl PlaybackObservation {
    pub fn at(position: f64) -> Self {
        Self {
            position,
            buffered: BufferedRanges::new(),
            speed: 1.,
            rebuffering: false,
        }
    }
}

impl Default for PlaybackObservation {
    fn default() -> Self {
        Self::at(0.)
    }
}

pub type ObservationHandle = watch::Receiver<PlaybackObservation>;

/// Write side of the observations, held by whoever drives the player.
///
/// The engine only reads observations, it never changes playback itself.
pub struct PlaybackObserver {
    sender: watch::Sender<PlaybackObservation>,
}

impl PlaybackObserver {
    pub fn new(initial: PlaybackObservation) -> (Self, ObservationHandle) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    pub fn observe(&self, observation: PlaybackObservation) {
        self.sender.send_replace(observation);
    }

    pub fn set_position(&self, position: f64) {
        self.sender.send_modify(|observation| observation.position = position);
    }

    pub fn current(&self) -> PlaybackObservation {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> ObservationHandle {
        self.sender.subscribe()
    }
}

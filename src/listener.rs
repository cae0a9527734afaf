//! Listener state shared by every player on a driver
//!
//! Holds the global gain and the listener's position/orientation.
//! Drivers read a snapshot when applying parameters to their native
//! side; the coordinate and gain encodings differ per backend, so the
//! conversion helpers live here too.

use std::sync::Arc;

use parking_lot::Mutex;

/// Listener values. Right-handed coordinate system; backends that invert
/// the z axis run the vectors through [`flip_z`] first.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerState {
    /// Master gain in `[0, 1]`.
    pub volume: f32,
    pub position: [f32; 3],
    pub forward_orientation: [f32; 3],
    pub up_orientation: [f32; 3],
}

impl Default for ListenerState {
    fn default() -> Self {
        Self {
            volume: 1.0,
            position: [0.0, 0.0, 0.0],
            forward_orientation: [0.0, 0.0, -1.0],
            up_orientation: [0.0, 1.0, 0.0],
        }
    }
}

/// Shared handle to the listener of a driver.
#[derive(Clone, Default)]
pub struct Listener {
    inner: Arc<Mutex<ListenerState>>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner.lock().volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    pub fn set_position(&self, position: [f32; 3]) {
        self.inner.lock().position = position;
    }

    pub fn set_forward_orientation(&self, orientation: [f32; 3]) {
        self.inner.lock().forward_orientation = orientation;
    }

    pub fn set_up_orientation(&self, orientation: [f32; 3]) {
        self.inner.lock().up_orientation = orientation;
    }

    /// Consistent copy of all listener values.
    pub fn snapshot(&self) -> ListenerState {
        self.inner.lock().clone()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Listener").field(&self.snapshot()).finish()
    }
}

/// Invert the z axis for backends with a left-handed convention.
pub fn flip_z(v: [f32; 3]) -> [f32; 3] {
    [v[0], v[1], -v[2]]
}

/// Encode a linear gain in `[0, 1]` as hundredths of a decibel, for
/// backends that express attenuation that way.
///
/// `clamp(floor(1000 * log2(min(gain, 1))), -10000, 0)`, with
/// non-positive gain mapping to the -100 dB floor.
pub fn gain_to_centidecibels(gain: f32) -> i32 {
    if gain <= 0.0 {
        return -10_000;
    }
    let db = (1000.0 * f64::from(gain.min(1.0)).log2()).floor() as i32;
    db.clamp(-10_000, 0)
}

// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A scaled virtual clock.
//!
//! Simulated durations are compressed by a constant scale factor when they are
//! slept for, and real durations are expanded by the same factor when they are
//! measured. A stage that takes 10 simulated minutes with a scale factor of
//! `6000.0` therefore occupies its worker for 100 milliseconds, and a run that
//! lasted 410 milliseconds is reported as 41 minutes.

use crate::error::{Error, Result};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// A monotonic time source whose delays run compressed by a scale factor.
pub struct Clock {
    /// Real-time compression divisor.
    scale_factor: f64,
    /// Instant from which [`since_origin()`](Self::since_origin) counts.
    origin: RwLock<Instant>,
}

impl Clock {
    /// Creates a clock with the given scale factor, whose origin is now.
    ///
    /// Fails if the scale factor isn't a positive finite number.
    pub fn new(scale_factor: f64) -> Result<Self> {
        if !scale_factor.is_finite() || scale_factor <= 0.0 {
            return Err(Error::invalid(
                "clock",
                format!("scale factor must be positive and finite, got {scale_factor}"),
            ));
        }
        Ok(Self {
            scale_factor,
            origin: RwLock::new(Instant::now()),
        })
    }

    /// Returns the scale factor of this clock.
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Returns the current monotonic time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Moves the origin of this clock to now.
    pub fn reset(&self) {
        *self.origin.write().unwrap() = Instant::now();
    }

    /// Returns the current origin of this clock.
    pub fn origin(&self) -> Instant {
        *self.origin.read().unwrap()
    }

    /// Sleeps for the given simulated duration, i.e. for `duration /
    /// scale_factor` of real time.
    pub fn scaled_sleep(&self, duration: Duration) {
        let real = self.to_real(duration);
        if !real.is_zero() {
            std::thread::sleep(real);
        }
    }

    /// Returns the simulated time elapsed since the given instant.
    pub fn elapsed_simulated(&self, start: Instant) -> Duration {
        self.to_simulated(self.now().saturating_duration_since(start))
    }

    /// Returns the simulated time elapsed since the origin of this clock.
    pub fn since_origin(&self) -> Duration {
        self.elapsed_simulated(self.origin())
    }

    /// Converts a simulated duration into the real duration it takes.
    pub fn to_real(&self, simulated: Duration) -> Duration {
        simulated.div_f64(self.scale_factor)
    }

    /// Converts a real duration into the simulated duration it represents.
    pub fn to_simulated(&self, real: Duration) -> Duration {
        real.mul_f64(self.scale_factor)
    }
}

/// Converts a duration into a (fractional) number of minutes.
pub fn as_minutes(duration: Duration) -> f64 {
    duration.as_secs_f64() / 60.0
}

/// Converts a number of minutes into a duration.
///
/// Fails on negative, NaN or infinite inputs.
pub fn from_minutes(minutes: f64) -> Result<Duration> {
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(Error::invalid(
            "duration",
            format!("expected a non-negative number of minutes, got {minutes}"),
        ));
    }
    Duration::try_from_secs_f64(minutes * 60.0)
        .map_err(|e| Error::invalid("duration", format!("{minutes} minutes: {e}")))
}

// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Screen recognition boundary
//!
//! Template matching itself happens elsewhere; this module only describes
//! what is asked for and what comes back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::ValidationError;

/// Rectangle on screen, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Result<Self, ValidationError> {
        if width == 0 || height == 0 {
            return Err(ValidationError::Empty { field: "region" });
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// Named image to look for, optionally restricted to a search region.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    name: String,
    region: Option<Region>,
}

impl Template {
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty {
                field: "template name",
            });
        }
        Ok(Self {
            name: name.to_string(),
            region: None,
        })
    }

    pub fn within(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    success: bool,
    confidence: f64,
    region: Option<Region>,
    processing_time: Duration,
    timestamp: DateTime<Utc>,
}

impl RecognitionResult {
    pub fn new(
        success: bool,
        confidence: f64,
        region: Option<Region>,
        processing_time: Duration,
    ) -> Result<Self, ValidationError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::OutOfRange {
                field: "confidence",
                min: 0.0,
                max: 1.0,
                value: confidence,
            });
        }
        if success && region.is_none() {
            return Err(ValidationError::MissingRegion);
        }
        Ok(Self {
            success,
            confidence,
            region,
            processing_time,
            timestamp: Utc::now(),
        })
    }

    pub fn matched(confidence: f64, region: Region, processing_time: Duration) -> Result<Self, ValidationError> {
        Self::new(true, confidence, Some(region), processing_time)
    }

    pub fn not_found(processing_time: Duration) -> Self {
        Self {
            success: false,
            confidence: 0.0,
            region: None,
            processing_time,
            timestamp: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Finds a template on screen.
///
/// Implementations may take tens to hundreds of milliseconds; callers go
/// through [`crate::gating::RecognitionGate`], which bounds the wait.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(
        &self,
        template: &Template,
        region: Option<Region>,
    ) -> anyhow::Result<RecognitionResult>;
}

/// Recognizer used when none is configured: nothing is ever found.
pub struct NoRecognizer;

#[async_trait]
impl Recognizer for NoRecognizer {
    async fn recognize(
        &self,
        _template: &Template,
        _region: Option<Region>,
    ) -> anyhow::Result<RecognitionResult> {
        Ok(RecognitionResult::not_found(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(0, 0, 32, 32).unwrap()
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(RecognitionResult::new(true, 1.2, Some(region()), Duration::ZERO).is_err());
        assert!(RecognitionResult::new(false, -0.1, None, Duration::ZERO).is_err());
        assert!(RecognitionResult::new(false, f64::NAN, None, Duration::ZERO).is_err());
        assert!(RecognitionResult::new(true, 0.9, Some(region()), Duration::ZERO).is_ok());
    }

    #[test]
    fn test_success_requires_region() {
        assert_eq!(
            RecognitionResult::new(true, 0.9, None, Duration::ZERO),
            Err(ValidationError::MissingRegion)
        );
        assert!(RecognitionResult::new(false, 0.0, None, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_empty_region_rejected() {
        assert!(Region::new(0, 0, 0, 10).is_err());
    }
}

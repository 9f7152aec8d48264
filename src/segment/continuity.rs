//! Continuity between neighbouring segments

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::fmp4::Init;

/// Whether `next` continues the recording described by `first`.
///
/// Track layouts must match exactly, and `next_start` must lie within
/// `tolerance` of `expected_end` in either direction.
pub fn can_concatenate(
    first: &Init,
    expected_end: DateTime<Utc>,
    next: &Init,
    next_start: DateTime<Utc>,
    tolerance: Duration,
) -> bool {
    if first.tracks != next.tracks {
        return false;
    }

    let drift = next_start.signed_duration_since(expected_end).abs();
    match chrono::Duration::from_std(tolerance) {
        Ok(tol) => drift <= tol,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::init::tests::{audio_track, video_track};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_adjacent_segments() {
        let init = Init {
            tracks: vec![video_track(1)],
        };
        let tol = Duration::from_millis(500);
        assert!(can_concatenate(&init, t(60), &init, t(60), tol));
        assert!(can_concatenate(
            &init,
            t(60),
            &init,
            t(60) + chrono::Duration::milliseconds(400),
            tol
        ));
        assert!(can_concatenate(
            &init,
            t(60),
            &init,
            t(60) - chrono::Duration::milliseconds(500),
            tol
        ));
    }

    #[test]
    fn test_gap_beyond_tolerance() {
        let init = Init {
            tracks: vec![video_track(1)],
        };
        let tol = Duration::from_millis(500);
        assert!(!can_concatenate(&init, t(60), &init, t(61), tol));
        assert!(!can_concatenate(&init, t(60), &init, t(59), tol));
    }

    #[test]
    fn test_track_mismatch() {
        let first = Init {
            tracks: vec![video_track(1)],
        };
        let next = Init {
            tracks: vec![video_track(1), audio_track(2)],
        };
        assert!(!can_concatenate(
            &first,
            t(60),
            &next,
            t(60),
            Duration::from_millis(500)
        ));

        let mut resized = video_track(1);
        resized.width = 1280;
        let next = Init {
            tracks: vec![resized],
        };
        assert!(!can_concatenate(
            &first,
            t(60),
            &next,
            t(60),
            Duration::from_millis(500)
        ));
    }
}

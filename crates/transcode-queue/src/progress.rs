use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Last known progress of a running transcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeProgress {
    /// Completion estimate in the range 0-100
    pub percent: f64,
    /// Encoder throughput reported by the transcoder
    pub fps: Option<f64>,
    /// Wall-clock seconds since the process was spawned
    pub elapsed_secs: f64,
    pub frame: Option<u64>,
    pub total_frames: Option<u64>,
    /// Media timestamp the encoder has reached
    #[serde(default)]
    pub out_time_secs: Option<f64>,
    /// Encode speed relative to realtime (e.g. 1.5 for "1.5x")
    #[serde(default)]
    pub speed: Option<f64>,
}

/// Incremental parser for ffmpeg's `-progress` output.
///
/// ffmpeg writes blocks of `key=value` lines and terminates every block with
/// `progress=continue` (or `progress=end` for the last one). The parser keeps
/// the latest value of every key it understands and yields one
/// [`TranscodeProgress`] per terminator line. Anything it does not understand
/// is ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total_frames: Option<u64>,
    duration_secs: Option<f64>,
    frame: Option<u64>,
    fps: Option<f64>,
    out_time_secs: Option<f64>,
    speed: Option<f64>,
}

impl ProgressParser {
    /// Create a parser; the totals come from the producer's probe data and are
    /// only used to turn frames or timestamps into a percentage
    pub fn new(total_frames: Option<u64>, duration_secs: Option<f64>) -> Self {
        Self {
            total_frames: total_frames.filter(|&t| t > 0),
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            ..Self::default()
        }
    }

    /// Feed one line; returns a snapshot when the line closes a progress block
    pub fn feed(&mut self, line: &str, elapsed: Duration) -> Option<TranscodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => {
                if let Ok(frame) = value.parse::<u64>() {
                    self.frame = Some(frame);
                }
            }
            "fps" => {
                self.fps = parse_non_negative(value);
            }
            // ffmpeg reports microseconds under both keys
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    if us >= 0 {
                        self.out_time_secs = Some(us as f64 / 1_000_000.0);
                    }
                }
            }
            "out_time" => {
                if let Some(secs) = parse_timestamp(value) {
                    self.out_time_secs = Some(secs);
                }
            }
            "speed" => {
                self.speed = parse_non_negative(value.trim_end_matches('x'));
            }
            "progress" => {
                let done = value == "end";
                return Some(self.snapshot(elapsed, done));
            }
            _ => {}
        }

        None
    }

    fn snapshot(&self, elapsed: Duration, done: bool) -> TranscodeProgress {
        TranscodeProgress {
            percent: self.percent(done),
            fps: self.fps,
            elapsed_secs: elapsed.as_secs_f64(),
            frame: self.frame,
            total_frames: self.total_frames,
            out_time_secs: self.out_time_secs,
            speed: self.speed,
        }
    }

    fn percent(&self, done: bool) -> f64 {
        if done {
            return 100.0;
        }

        // Frame counts are exact; fall back to the media clock when the
        // producer did not know the frame total
        let raw = match (self.frame, self.total_frames) {
            (Some(frame), Some(total)) => frame as f64 / total as f64 * 100.0,
            _ => match (self.out_time_secs, self.duration_secs) {
                (Some(at), Some(duration)) => at / duration * 100.0,
                _ => 0.0,
            },
        };

        if raw.is_finite() {
            raw.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

fn parse_non_negative(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parse an `HH:MM:SS.ffffff` timestamp into seconds
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours = parts.next()?.parse::<u64>().ok()?;
    let minutes = parts.next()?.parse::<u64>().ok()?;
    let seconds = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || minutes >= 60 || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(parser: &mut ProgressParser, block: &str) -> Vec<TranscodeProgress> {
        block
            .lines()
            .filter_map(|line| parser.feed(line, Duration::from_secs(2)))
            .collect()
    }

    #[test]
    fn test_block_yields_single_snapshot() {
        let mut parser = ProgressParser::new(Some(1000), None);
        let block = "frame=250\nfps=48.50\nstream_0_0_q=28.0\nbitrate=1200.5kbits/s\n\
                     out_time_us=10000000\nout_time=00:00:10.000000\nspeed=1.94x\nprogress=continue\n";
        let snapshots = feed_all(&mut parser, block);

        assert_eq!(snapshots.len(), 1);
        let p = &snapshots[0];
        assert_eq!(p.frame, Some(250));
        assert_eq!(p.total_frames, Some(1000));
        assert_eq!(p.fps, Some(48.5));
        assert_eq!(p.speed, Some(1.94));
        assert_eq!(p.out_time_secs, Some(10.0));
        assert!((p.percent - 25.0).abs() < f64::EPSILON);
        assert!((p.elapsed_secs - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_percent_falls_back_to_duration() {
        let mut parser = ProgressParser::new(None, Some(200.0));
        let snapshots = feed_all(&mut parser, "frame=10\nout_time=00:00:50.000000\nprogress=continue");
        assert!((snapshots[0].percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_end_marker_reports_complete() {
        let mut parser = ProgressParser::new(None, None);
        let snapshots = feed_all(&mut parser, "frame=10\nprogress=continue\nframe=20\nprogress=end");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].percent, 0.0);
        assert_eq!(snapshots[1].percent, 100.0);
        assert_eq!(snapshots[1].frame, Some(20));
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let mut parser = ProgressParser::new(Some(100), None);
        let block = "garbage\nframe=abc\nfps=N/A\n=\nspeed=N/A\nframe=50\nprogress=continue";
        let snapshots = feed_all(&mut parser, block);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].frame, Some(50));
        assert_eq!(snapshots[0].fps, None);
        assert_eq!(snapshots[0].speed, None);
    }

    #[test]
    fn test_percent_is_clamped_when_totals_are_wrong() {
        let mut parser = ProgressParser::new(Some(10), None);
        let snapshots = feed_all(&mut parser, "frame=50\nprogress=continue");
        assert_eq!(snapshots[0].percent, 100.0);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("01:30:00.000000"), Some(5400.0));
        assert_eq!(parse_timestamp("00:00:10.5"), Some(10.5));
        assert_eq!(parse_timestamp("-577014:32:22.77"), None);
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("00:75:00"), None);
    }

    proptest! {
        /// Arbitrary input never panics and never produces an out-of-range percent
        #[test]
        fn test_arbitrary_lines_keep_percent_in_range(
            lines in prop::collection::vec(".{0,40}", 0..30),
            total in prop::option::of(0u64..10_000),
            duration in prop::option::of(-10.0f64..10_000.0),
        ) {
            let mut parser = ProgressParser::new(total, duration);
            for line in &lines {
                if let Some(p) = parser.feed(line, Duration::from_millis(5)) {
                    prop_assert!(p.percent >= 0.0 && p.percent <= 100.0);
                }
            }
            if let Some(p) = parser.feed("progress=continue", Duration::ZERO) {
                prop_assert!(p.percent >= 0.0 && p.percent <= 100.0);
            }
        }

        #[test]
        fn test_frame_ratio_matches_percent(frame in 0u64..5000, total in 1u64..5000) {
            let mut parser = ProgressParser::new(Some(total), None);
            parser.feed(&format!("frame={}", frame), Duration::ZERO);
            let p = parser.feed("progress=continue", Duration::ZERO).unwrap();
            let expected = (frame as f64 / total as f64 * 100.0).min(100.0);
            prop_assert!((p.percent - expected).abs() < 1e-9);
        }
    }
}

//! Parser for ffmpeg's `-progress pipe:1` output.
//!
//! ffmpeg writes blocks of `key=value` lines, each block terminated by
//! `progress=continue` or `progress=end`. [`ProgressState`] keeps the latest
//! values and reports a [`ProgressMarker`] whenever a block closes.

/// Parse a `HH:MM:SS.micro` timestamp into seconds.
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_time("00:00:10.500000"), Some(10.5));
/// assert_eq!(parse_time("-577014:32:22.775808"), None);
/// ```
pub fn parse_time(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse a speed multiplier such as `1.53x`. `N/A` yields `None`.
pub fn parse_speed(value: &str) -> Option<f64> {
    let speed: f64 = value.trim().trim_end_matches('x').trim().parse().ok()?;
    speed.is_finite().then_some(speed)
}

/// Block terminator seen on the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMarker {
    Continue,
    End,
}

/// Latest values accumulated from the progress stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub out_time_secs: Option<f64>,
    pub speed: Option<f64>,
    pub total_size: Option<u64>,
    pub frame: Option<u64>,
}

impl ProgressState {
    /// Consume one line; returns a marker when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<ProgressMarker> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key.trim() {
            // `out_time_ms` is also microseconds; ffmpeg never fixed the name.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>()
                    && us >= 0
                {
                    self.out_time_secs = Some(us as f64 / 1_000_000.0);
                }
            }
            "out_time" => {
                if self.out_time_secs.is_none()
                    && let Some(secs) = parse_time(value)
                {
                    self.out_time_secs = Some(secs);
                }
            }
            "speed" => self.speed = parse_speed(value),
            "total_size" => self.total_size = value.parse().ok(),
            "frame" => self.frame = value.parse().ok(),
            "progress" => {
                return Some(if value == "end" {
                    ProgressMarker::End
                } else {
                    ProgressMarker::Continue
                });
            }
            _ => {}
        }
        None
    }

    pub fn percent(&self, total_duration: f64) -> u8 {
        percent_of(self.out_time_secs.unwrap_or(0.0), total_duration)
    }

    pub fn eta_secs(&self, total_duration: f64) -> f64 {
        eta_secs(
            self.out_time_secs.unwrap_or(0.0),
            total_duration,
            self.speed.unwrap_or(0.0),
        )
    }
}

/// `min(99, floor(elapsed / total * 100))`; 0 when the duration is unknown.
pub fn percent_of(elapsed: f64, total_duration: f64) -> u8 {
    if !(total_duration > 0.0) || !(elapsed > 0.0) {
        return 0;
    }
    let pct = (elapsed / total_duration * 100.0).floor();
    pct.min(99.0) as u8
}

/// `(total - elapsed) / speed`; 0 when the speed is non-positive or unknown.
pub fn eta_secs(elapsed: f64, total_duration: f64, speed: f64) -> f64 {
    if !(speed > 0.0) || !(total_duration > 0.0) {
        return 0.0;
    }
    ((total_duration - elapsed) / speed).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.500000"), Some(10.5));
        assert_eq!(parse_time("01:30:00.000000"), Some(5400.0));
        assert_eq!(parse_time("-577014:32:22.775808"), None);
        assert_eq!(parse_time("N/A"), None);
        assert_eq!(parse_time("1:2:3:4"), None);
    }

    #[test]
    fn test_parse_speed() {
        assert_eq!(parse_speed("1.53x"), Some(1.53));
        assert_eq!(parse_speed(" 12x"), Some(12.0));
        assert_eq!(parse_speed("N/A"), None);
    }

    #[test]
    fn test_feed_block() {
        let block = "frame=240\nfps=60.0\nout_time_us=10000000\nout_time=00:00:10.000000\n\
                     total_size=1048576\nspeed=2.5x\nprogress=continue";
        let mut state = ProgressState::default();
        let markers: Vec<_> = block.lines().filter_map(|l| state.feed(l)).collect();

        assert_eq!(markers, vec![ProgressMarker::Continue]);
        assert_eq!(state.out_time_secs, Some(10.0));
        assert_eq!(state.speed, Some(2.5));
        assert_eq!(state.total_size, Some(1_048_576));
        assert_eq!(state.frame, Some(240));
        assert_eq!(state.percent(40.0), 25);
        assert_eq!(state.eta_secs(40.0), 12.0);
    }

    #[test]
    fn test_negative_out_time_ignored() {
        let mut state = ProgressState::default();
        state.feed("out_time_us=-9223372036854775807");
        state.feed("out_time=-577014:32:22.775808");
        assert_eq!(state.out_time_secs, None);
        assert_eq!(state.feed("progress=end"), Some(ProgressMarker::End));
    }

    #[test]
    fn test_percent_is_capped() {
        assert_eq!(percent_of(120.0, 100.0), 99);
        assert_eq!(percent_of(99.9, 100.0), 99);
        assert_eq!(percent_of(49.99, 100.0), 49);
        assert_eq!(percent_of(10.0, 0.0), 0);
        assert_eq!(percent_of(f64::NAN, 10.0), 0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_secs(30.0, 90.0, 2.0), 30.0);
        assert_eq!(eta_secs(30.0, 90.0, 0.0), 0.0);
        assert_eq!(eta_secs(30.0, 90.0, -1.0), 0.0);
        assert_eq!(eta_secs(100.0, 90.0, 1.0), 0.0);
    }
}

//! Heartbeat declarations and period negotiation.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `heart-beat` declaration, in milliseconds.
///
/// `x` is the smallest interval at which the declarer can send heartbeats and
/// `y` the interval at which it wants to receive them. Zero disables the
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub x: u64,
    pub y: u64,
}

impl Heartbeat {
    pub const DISABLED: Heartbeat = Heartbeat { x: 0, y: 0 };

    pub fn new(x: u64, y: u64) -> Self {
        Self { x, y }
    }

    /// Parses a header value. A missing header means no heartbeats.
    pub fn parse(header: Option<&str>) -> Result<Self, ProtocolError> {
        let Some(value) = header else {
            return Ok(Self::DISABLED);
        };
        let invalid = || ProtocolError::InvalidHeartbeat(value.to_string());
        let (x, y) = value.split_once(',').ok_or_else(invalid)?;
        let x = x.trim().parse().map_err(|_| invalid())?;
        let y = y.trim().parse().map_err(|_| invalid())?;
        Ok(Self { x, y })
    }

    /// Interval at which `local` must send heartbeats to `remote`.
    pub fn compute_ping_period(local: &Heartbeat, remote: &Heartbeat) -> u64 {
        if local.x == 0 || remote.y == 0 {
            return 0;
        }
        local.x.max(remote.y)
    }

    /// Interval at which `local` expects heartbeats from `remote`.
    pub fn compute_pong_period(local: &Heartbeat, remote: &Heartbeat) -> u64 {
        if local.y == 0 || remote.x == 0 {
            return 0;
        }
        local.y.max(remote.x)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { x: 1000, y: 1000 }
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl std::str::FromStr for Heartbeat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(Some(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(x: u64, y: u64) -> Heartbeat {
        Heartbeat::new(x, y)
    }

    #[test]
    fn test_parse() {
        assert_eq!(Heartbeat::parse(None).unwrap(), Heartbeat::DISABLED);
        assert_eq!(Heartbeat::parse(Some("10,20")).unwrap(), hb(10, 20));
        assert_eq!("0,0".parse::<Heartbeat>().unwrap(), Heartbeat::DISABLED);
        assert!(Heartbeat::parse(Some("10")).is_err());
        assert!(Heartbeat::parse(Some("a,b")).is_err());
        assert!(Heartbeat::parse(Some("-1,0")).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(hb(1000, 500).to_string(), "1000,500");
        assert_eq!(Heartbeat::default().to_string(), "1000,1000");
    }

    #[test]
    fn test_disabled_pairs() {
        for (a, b) in [(hb(0, 0), hb(0, 0)), (hb(0, 1), hb(0, 1)), (hb(1, 0), hb(1, 0))] {
            assert_eq!(Heartbeat::compute_ping_period(&a, &b), 0);
            assert_eq!(Heartbeat::compute_pong_period(&a, &b), 0);
        }
    }

    #[test]
    fn test_one_one() {
        let a = hb(1, 1);
        assert_eq!(Heartbeat::compute_ping_period(&a, &a), 1);
        assert_eq!(Heartbeat::compute_pong_period(&a, &a), 1);
    }

    #[test]
    fn test_asymmetric_pair() {
        let client = hb(1, 2);
        let server = hb(3, 4);

        assert_eq!(Heartbeat::compute_ping_period(&client, &server), 4);
        assert_eq!(Heartbeat::compute_pong_period(&client, &server), 3);

        assert_eq!(Heartbeat::compute_ping_period(&server, &client), 3);
        assert_eq!(Heartbeat::compute_pong_period(&server, &client), 4);
    }

    #[test]
    fn test_one_side_disabled() {
        // client can send but does not want to receive
        let client = hb(100, 0);
        let server = hb(50, 200);
        assert_eq!(Heartbeat::compute_ping_period(&client, &server), 200);
        assert_eq!(Heartbeat::compute_pong_period(&client, &server), 0);
        assert_eq!(Heartbeat::compute_ping_period(&server, &client), 0);
        assert_eq!(Heartbeat::compute_pong_period(&server, &client), 200);
    }
}

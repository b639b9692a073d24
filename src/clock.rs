//! NTP-corrected wall clock.
//!
//! All block timestamps come from here. The reported time never moves
//! backwards: offset adjustments are folded under a monotone floor.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;

use crate::config;
use crate::errors::{NodeError, NodeResult};

const ADJUST_INTERVAL_SECS: u64 = 600;
const SNTP_TIMEOUT: Duration = Duration::from_secs(3);

// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared clock handle. Cheap to clone; all clones see the same offset.
#[derive(Clone)]
pub struct Clock {
    offset_ms: Arc<AtomicI64>,
    floor_ms: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(0)),
            floor_ms: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Corrected unix milliseconds, clamped so repeated calls never decrease.
    pub fn now_ms(&self) -> u64 {
        let raw = wall_ms().saturating_add_signed(self.offset_ms.load(Ordering::Relaxed));
        let prev = self.floor_ms.fetch_max(raw, Ordering::Relaxed);
        raw.max(prev)
    }

    /// Corrected unix seconds.
    pub fn now_s(&self) -> u64 {
        self.now_ms() / 1000
    }

    /// Current NTP offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Start the background offset adjuster. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let offset = Arc::clone(&self.offset_ms);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let host = config::ntp_host();
            while running.load(Ordering::SeqCst) {
                match sntp_offset_ms(&host).await {
                    Ok(delta) => {
                        offset.store(delta, Ordering::Relaxed);
                        tracing::debug!(offset_ms = delta, "[CLOCK] ntp offset updated");
                    }
                    Err(e) => {
                        tracing::debug!(err = %e, host = %host, "[CLOCK] ntp query failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(ADJUST_INTERVAL_SECS)).await;
            }
        });
    }

    /// Stop the background adjuster. The last offset stays in effect.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One SNTP mode-3 exchange; returns server time minus local time in ms.
async fn sntp_offset_ms(host: &str) -> NodeResult<i64> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(host).await?;

    let mut packet = [0u8; 48];
    packet[0] = 0x1B; // LI=0, VN=3, mode=3 (client)
    socket.send(&packet).await?;

    let mut buf = [0u8; 48];
    let n = tokio::time::timeout(SNTP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| NodeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "sntp")))??;
    if n < 48 {
        return Err(NodeError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short sntp reply",
        )));
    }

    // Transmit timestamp: seconds + fraction at bytes 40..48.
    let secs = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]) as u64;
    let frac = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]) as u64;
    let server_ms = secs.saturating_sub(NTP_UNIX_DELTA) * 1000 + ((frac * 1000) >> 32);
    Ok(server_ms as i64 - wall_ms() as i64)
}

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

/// Throughput in kbit/s for `bytes` received over `elapsed`.
pub fn kbps(bytes: usize, elapsed: Duration) -> u32 {
    let millis = elapsed.as_millis().max(1);
    // bits per millisecond == kilobits per second
    let rate = (bytes as u128 * 8) / millis;
    rate.min(u32::MAX as u128) as u32
}

/// Download up to `max_bytes` from `url` and estimate throughput.
///
/// Stops at the timeout and measures whatever arrived by then.
pub async fn probe(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
    timeout: Duration,
) -> Result<u32, ProbeError> {
    let started = Instant::now();
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ProbeError::Status(response.status()));
    }

    let mut received = 0usize;
    let mut chunks = response.bytes_stream();
    let read = async {
        while let Some(chunk) = chunks.next().await {
            received += chunk?.len();
            if received >= max_bytes {
                break;
            }
        }
        Ok::<(), reqwest::Error>(())
    };
    let outcome = tokio::time::timeout(timeout, read).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => debug!("bandwidth probe hit timeout after {} bytes", received),
    }

    if received == 0 {
        return Err(ProbeError::Empty);
    }
    Ok(kbps(received, started.elapsed()))
}

/// Run the probe once and report the estimate, or `None` if it failed.
pub async fn measure(client: reqwest::Client, url: String, max_bytes: usize, timeout: Duration) -> Option<u32> {
    match probe(&client, &url, max_bytes, timeout).await {
        Ok(rate) => {
            info!("Bandwidth probe: ~{} kbps", rate);
            Some(rate)
        }
        Err(e) => {
            warn!("Bandwidth probe failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kbps_is_bits_per_millisecond() {
        // 1 MB in one second is 8000 kbps
        assert_eq!(kbps(1_000_000, Duration::from_secs(1)), 8_000);
        // 256 KB in one second is just above the preload threshold
        assert_eq!(kbps(262_144, Duration::from_secs(1)), 2_097);
    }

    #[test]
    fn test_kbps_never_divides_by_zero() {
        assert_eq!(kbps(1_000, Duration::ZERO), 8_000);
    }
}

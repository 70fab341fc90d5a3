//! Host metrics as probe payloads.
//!
//! Each payload is a fresh reading of CPU, memory, root disk and network
//! counters, so probe records look like ordinary host telemetry.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use replverify_core::{Payload, PayloadSource};
use sysinfo::{Disks, Networks, System};

/// Gap between the two CPU refreshes a usage reading needs.
const CPU_SAMPLE_GAP: Duration = Duration::from_millis(100);

/// Samples local host metrics for every write.
pub struct HostMetricsSource {
    system: Mutex<System>,
}

impl HostMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_cpu(&self) {
        self.system
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_cpu();
    }
}

impl Default for HostMetricsSource {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

#[async_trait]
impl PayloadSource for HostMetricsSource {
    async fn next_payload(&self) -> Payload {
        self.refresh_cpu();
        tokio::time::sleep(CPU_SAMPLE_GAP).await;

        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_cpu();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_info().cpu_usage()),
                percent(system.used_memory(), system.total_memory()),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map_or(0.0, |disk| {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            });

        let networks = Networks::new_with_refreshed_list();
        let (sent, received) = networks
            .iter()
            .fold((0_u64, 0_u64), |(sent, received), (_, data)| {
                (
                    sent.saturating_add(data.total_transmitted()),
                    received.saturating_add(data.total_received()),
                )
            });

        Payload::from([
            ("cpu_percent".to_string(), cpu_percent),
            ("memory_percent".to_string(), memory_percent),
            ("disk_percent".to_string(), disk_percent),
            ("network_sent_bytes".to_string(), counter(sent)),
            ("network_recv_bytes".to_string(), counter(received)),
        ])
    }
}

#[allow(clippy::cast_precision_loss)]
fn counter(value: u64) -> f64 {
    value as f64
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    counter(part) / counter(whole) * 100.0
}

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Process-wide table of claimed capture devices.
///
/// A device key (`usb:0`, `ip:rtsp://...`) can be held by at most one [`DeviceLease`] at a
/// time. Claims never wait: a busy device is reported immediately so the caller can surface
/// `DeviceUnavailable` instead of queuing behind another source.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_claim(&self, device: &str) -> Option<DeviceLease> {
        let lock = self.get_or_create_lock(device).await;

        match lock.try_lock_owned() {
            Ok(guard) => {
                tracing::debug!(device = %device, "Device claimed");
                Some(DeviceLease {
                    device: device.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::debug!(device = %device, "Device claim denied - already held");
                None
            }
        }
    }

    pub async fn is_claimed(&self, device: &str) -> bool {
        let locks = self.locks.read().await;
        locks
            .get(device)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    async fn get_or_create_lock(&self, device: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(device) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(device.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Exclusive claim on one device; released on drop.
pub struct DeviceLease {
    device: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device, "Device claim released");
    }
}

//! Device-list extraction and bulk session injection during multi-device sync.

use futures::future::try_join_all;
use tracing::{debug, warn};
use wamd_protocol::{address, Address, DirectoryResult, UserKeyBundle};

use crate::error::{Result, SignalError};
use crate::session::SignalRepository;

/// Every device address that should receive a copy of an outbound payload.
///
/// A device is kept unless it is a primary device and `exclude_zero_devices`
/// is set, it is our own device, or it is a companion device without a key
/// index (not provisioned). Results whose id does not parse are skipped.
///
/// The key-index rule can hide a provisioned device if the directory ever
/// omits the index for another reason.
pub fn extract_addresses(
    results: &[DirectoryResult],
    self_address: &Address,
    exclude_zero_devices: bool,
) -> Vec<Address> {
    let mut extracted = Vec::new();
    for result in results {
        let user = match address::parse(&result.id) {
            Ok(user) => user,
            Err(e) => {
                debug!("skipping directory result: {e}");
                continue;
            }
        };
        let Some(devices) = &result.devices else {
            continue;
        };

        for entry in &devices.device_list {
            let candidate = user.with_device(entry.id);
            if exclude_zero_devices && entry.id == 0 {
                continue;
            }
            if candidate == *self_address {
                continue;
            }
            if entry.id != 0 && entry.key_index.is_none() {
                continue;
            }
            extracted.push(candidate);
        }
    }
    extracted
}

/// Inject sessions for every user of a key query response.
///
/// The whole response is rejected if any entry carries an error. Injection
/// runs in chunks of `injection_chunk_size` users, each chunk concurrently,
/// yielding to the scheduler between chunks. Returns how many sessions were
/// injected.
pub async fn inject_e2e_sessions(
    repository: &SignalRepository,
    bundles: &[UserKeyBundle],
) -> Result<usize> {
    for bundle in bundles {
        if let Some(error) = &bundle.error {
            warn!(
                code = error.code,
                "key bundle for {} rejected: {}",
                bundle.identifier(),
                error.text
            );
            return Err(SignalError::KeyBundleRejected {
                identifier: bundle.identifier().to_string(),
                code: error.code,
                text: error.text.clone(),
            });
        }
    }

    let chunk_size = repository.config().injection_chunk_size.max(1);
    let mut injected = 0;
    for chunk in bundles.chunks(chunk_size) {
        let sessions = chunk.iter().filter_map(|bundle| {
            bundle
                .session
                .as_ref()
                .map(|session| (bundle.identifier(), session))
        });
        let count = try_join_all(sessions.map(|(identifier, session)| async move {
            let peer = address::parse(identifier)?;
            repository.inject_session(&peer, session).await?;
            Ok::<(), SignalError>(())
        }))
        .await?
        .len();
        injected += count;
        debug!(count, "injected session chunk");
        tokio::task::yield_now().await;
    }
    Ok(injected)
}

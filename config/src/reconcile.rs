//! Reconciliation between a local working copy, its origin and the cache.
//!
//! Three actors: the mutable local copy, the authoritative origin backend
//! recorded in the `domain` table, and an optional fast cache derived from
//! tier configuration. Checksums held in the metadata table decide whether
//! to upload, download or skip; a stale expected checksum is the
//! optimistic compare-and-set that keeps concurrent editors from silently
//! overwriting each other.
//!
//! Outcomes are result records, not errors: the caller decides whether to
//! retry, force or diff.

use crate::backends::create_backend;
use crate::error::{ConfigError, Result};
use relib::{integrity, Backend, TableStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Why a push ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushReason {
    /// Origin has changed since the last pull; nothing was written.
    ChecksumDiffer,
    /// Local and origin already agree; no upload was needed.
    PushSkippedCrcMatch,
    /// Local was written to origin.
    PushedToOrigin,
}

impl std::fmt::Display for PushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PushReason::ChecksumDiffer => "checksum_differ",
            PushReason::PushSkippedCrcMatch => "push_skipped_crc_match",
            PushReason::PushedToOrigin => "pushed_to_origin",
        };
        f.write_str(text)
    }
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushResult {
    pub pushed: bool,
    pub reason: PushReason,
    /// Local metadata document, included when the push was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_meta: Option<Value>,
    /// Origin metadata document, included when the push was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_meta: Option<Value>,
    /// The origin checksum the push expected to find.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
}

/// Why a pull ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullReason {
    /// The local copy has unpushed edits; nothing was replaced.
    LocalIsModified,
    /// Local and origin already agree; the local copy was kept.
    PullSkippedCrcMatch,
    /// The local copy was replaced with the origin's content.
    PulledFromOrigin,
}

impl std::fmt::Display for PullReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PullReason::LocalIsModified => "local_is_modified",
            PullReason::PullSkippedCrcMatch => "pull_skipped_crc_match",
            PullReason::PulledFromOrigin => "pulled_from_origin",
        };
        f.write_str(text)
    }
}

/// Outcome of a pull attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullResult {
    pub pulled: bool,
    pub reason: PullReason,
}

/// The origin URL recorded in the `domain` table of `ts`.
pub fn get_origin_url(ts: &TableStore) -> Result<String> {
    let origin = ts
        .get_table("domain")?
        .single_field("origin")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if origin.is_empty() {
        return Err(ConfigError::ConfigNotFound(
            "The domain table carries no origin URL.".to_string(),
        ));
    }
    Ok(origin)
}

/// Push `local_ts` to its origin; desired outcome: origin equals local.
///
/// If the origin has not changed since the last pull the local copy is
/// uploaded (or the upload is skipped outright when nothing changed
/// locally either). A diverged origin is never overwritten silently;
/// pass `force` to override. `expected_origin_checksum` is the origin
/// checksum recorded when the local copy was pulled - the compare half of
/// the check-and-set.
pub fn push_to_origin(
    local_ts: &mut TableStore,
    force: bool,
    expected_origin_checksum: Option<&str>,
) -> Result<PushResult> {
    let origin_url = get_origin_url(local_ts)?;
    let mut origin_backend = create_backend(&origin_url)?;

    let mut force = force;
    let mut origin_ts = None;
    match origin_backend.load_table_store() {
        Ok(ts) => origin_ts = Some(ts),
        Err(relib::Error::BackendFileNotFound(file)) => {
            // No origin yet; this is the first push.
            warn!("Origin {} holds no table store ('{}' missing).", origin_url, file);
            force = true;
        }
        Err(e) => return Err(e.into()),
    }

    let expected = match expected_origin_checksum {
        Some(crc) => crc.to_string(),
        None => local_ts.checksum()?,
    };
    let mut crc_match = match &origin_ts {
        Some(origin) => expected == origin.checksum()?,
        None => true,
    };

    if !crc_match && !force {
        return Ok(PushResult {
            pushed: false,
            reason: PushReason::ChecksumDiffer,
            local_meta: Some(local_ts.meta_row()?.clone()),
            origin_meta: origin_ts
                .as_ref()
                .map(|o| o.meta_row().map(Value::clone))
                .transpose()?,
            expected_checksum: Some(expected),
        });
    }

    let (old, new) = local_ts.refresh_metadata()?;

    if let Some(origin) = &origin_ts {
        crc_match = local_ts.checksum()? == origin.checksum()?;
    }
    if crc_match && old == new && !force {
        return Ok(PushResult {
            pushed: true,
            reason: PushReason::PushSkippedCrcMatch,
            local_meta: None,
            origin_meta: None,
            expected_checksum: None,
        });
    }

    // Whatever a repair session may have relaxed, bytes written to the
    // origin are always fully checked.
    {
        let _guard = integrity::force_all();
        local_ts.save_to_backend(origin_backend.as_mut())?;
    }
    debug!("Pushed {} to {}", local_ts, origin_url);

    Ok(PushResult {
        pushed: true,
        reason: PushReason::PushedToOrigin,
        local_meta: None,
        origin_meta: None,
        expected_checksum: None,
    })
}

/// Pull from origin into `local_ts`; desired outcome: local equals origin.
///
/// Local modifications are detected by refreshing the metadata; a modified
/// local copy is left alone unless `ignore_if_modified` is set. On a
/// checksum match the local copy is kept (unless `force`), otherwise it is
/// replaced in place with the origin's content.
pub fn pull_from_origin(
    local_ts: &mut TableStore,
    ignore_if_modified: bool,
    force: bool,
) -> Result<PullResult> {
    let origin_url = get_origin_url(local_ts)?;
    let origin_ts = create_backend(&origin_url)?.load_table_store()?;

    let (old, new) = local_ts.refresh_metadata()?;
    if old != new && !ignore_if_modified {
        return Ok(PullResult {
            pulled: false,
            reason: PullReason::LocalIsModified,
        });
    }

    let crc_match = local_ts.checksum()? == origin_ts.checksum()?;
    if crc_match && !force {
        return Ok(PullResult {
            pulled: true,
            reason: PullReason::PullSkippedCrcMatch,
        });
    }

    debug!("Pulled {} from {}", origin_ts, origin_url);
    *local_ts = origin_ts;
    Ok(PullResult {
        pulled: true,
        reason: PullReason::PulledFromOrigin,
    })
}

/// The cache backend for tier `tier_name`, if one is configured on the
/// tier row. Returns `None` when the tier defines no cache.
pub fn get_cache_backend(ts: &TableStore, tier_name: &str) -> Result<Option<Box<dyn Backend>>> {
    let tiers = ts.get_table("tiers")?;
    let tier = tiers
        .get(&serde_json::json!({"tier_name": tier_name}))?
        .ok_or_else(|| {
            ConfigError::ConfigNotFound(format!("Tier '{}' not found.", tier_name))
        })?;

    match tier.get("cache").and_then(Value::as_str) {
        Some(cache_url) if !cache_url.is_empty() => Ok(Some(create_backend(cache_url)?)),
        _ => Ok(None),
    }
}

/// Push `ts` to its designated cache on tier `tier_name`. Returns the
/// cache URL when an update happened.
pub fn update_cache(ts: &mut TableStore, tier_name: &str) -> Result<Option<String>> {
    match get_cache_backend(ts, tier_name)? {
        Some(mut backend) => {
            backend.save_table_store(ts)?;
            Ok(Some(backend.get_url()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_render_snake_case() {
        assert_eq!(PushReason::ChecksumDiffer.to_string(), "checksum_differ");
        assert_eq!(PushReason::PushSkippedCrcMatch.to_string(), "push_skipped_crc_match");
        assert_eq!(PushReason::PushedToOrigin.to_string(), "pushed_to_origin");
        assert_eq!(PullReason::LocalIsModified.to_string(), "local_is_modified");
        assert_eq!(PullReason::PullSkippedCrcMatch.to_string(), "pull_skipped_crc_match");
        assert_eq!(PullReason::PulledFromOrigin.to_string(), "pulled_from_origin");

        // The serialized form matches the display form.
        let text = serde_json::to_string(&PushReason::ChecksumDiffer).unwrap();
        assert_eq!(text, "\"checksum_differ\"");
    }

    #[test]
    fn origin_url_required() {
        let mut ts = TableStore::new();
        let domain = ts.add_single_row_table("domain").unwrap();
        domain
            .add_default_values(serde_json::json!({"domain_name": "", "origin": ""}))
            .unwrap();

        let err = get_origin_url(&ts).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigNotFound(_)));
    }
}

//! The closed RPC method set and its dispatcher.
//!
//! Every method has a validated parameter struct. Lenient mode ignores
//! unknown fields; strict mode (`rpc_strict_params`) rejects them by
//! comparing the incoming keys against the schema's.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::protocol::RpcError;
use crate::controller::{AddOptions, Controller, ScheduleRule, UA_PRESETS, decode_torrent_data};
use crate::error::EngineError;
use crate::record::{DownloadId, Priority};
use crate::storage::DownloadStore;
use crate::torrent::{MagnetLink, Metainfo};

/// The recognized methods. The set is closed: anything else is
/// `method_not_found`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    AddDownload,
    AddUrls,
    AddTorrentFile,
    AddMagnet,
    PauseDownload,
    PauseAll,
    ResumeDownload,
    ResumeAll,
    RemoveDownload,
    GetDownloadStatus,
    GetAllDownloads,
    GetActiveDownloads,
    GetGlobalStats,
    SetSpeedLimit,
    SetPriority,
    ParseTorrentFile,
    ParseMagnetUri,
    GetPeers,
    GetTorrentFiles,
    SelectTorrentFiles,
    GetSettings,
    UpdateSettings,
    SetCloseToTray,
    SetUserAgent,
    GetTrackerList,
    UpdateTrackerList,
    ApplySettingsToEngine,
    GetUserAgentPresets,
    GetEngineVersion,
    GetDefaultDownloadPath,
    GetScheduleRules,
    SetScheduleRules,
    DbGet,
    DbSet,
    DbDelete,
    DbList,
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "add_download" => Self::AddDownload,
            "add_urls" => Self::AddUrls,
            "add_torrent_file" => Self::AddTorrentFile,
            "add_magnet" => Self::AddMagnet,
            "pause_download" => Self::PauseDownload,
            "pause_all" => Self::PauseAll,
            "resume_download" => Self::ResumeDownload,
            "resume_all" => Self::ResumeAll,
            "remove_download" => Self::RemoveDownload,
            "get_download_status" => Self::GetDownloadStatus,
            "get_all_downloads" => Self::GetAllDownloads,
            "get_active_downloads" => Self::GetActiveDownloads,
            "get_global_stats" => Self::GetGlobalStats,
            "set_speed_limit" => Self::SetSpeedLimit,
            "set_priority" => Self::SetPriority,
            "parse_torrent_file" => Self::ParseTorrentFile,
            "parse_magnet_uri" => Self::ParseMagnetUri,
            "get_peers" => Self::GetPeers,
            "get_torrent_files" => Self::GetTorrentFiles,
            "select_torrent_files" => Self::SelectTorrentFiles,
            "get_settings" => Self::GetSettings,
            "update_settings" => Self::UpdateSettings,
            "set_close_to_tray" => Self::SetCloseToTray,
            "set_user_agent" => Self::SetUserAgent,
            "get_tracker_list" => Self::GetTrackerList,
            "update_tracker_list" => Self::UpdateTrackerList,
            "apply_settings_to_engine" => Self::ApplySettingsToEngine,
            "get_user_agent_presets" => Self::GetUserAgentPresets,
            "get_engine_version" => Self::GetEngineVersion,
            "get_default_download_path" => Self::GetDefaultDownloadPath,
            "get_schedule_rules" => Self::GetScheduleRules,
            "set_schedule_rules" => Self::SetScheduleRules,
            "db_get" => Self::DbGet,
            "db_set" => Self::DbSet,
            "db_delete" => Self::DbDelete,
            "db_list" => Self::DbList,
            _ => return Err(()),
        })
    }
}

// ---------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct AddDownloadParams {
    url: String,
    #[serde(flatten)]
    options: AddOptionParams,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct AddUrlsParams {
    urls: Vec<String>,
    #[serde(flatten)]
    options: AddOptionParams,
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
struct AddOptionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
    #[serde(default)]
    sequential: bool,
}

impl From<AddOptionParams> for AddOptions {
    fn from(params: AddOptionParams) -> Self {
        Self {
            dir: params.dir,
            filename: params.filename,
            headers: params.headers,
            user_agent: params.user_agent,
            referrer: params.referrer,
            checksum: params.checksum,
            priority: params.priority,
            sequential: params.sequential,
        }
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct TorrentFileParams {
    /// Path to a `.torrent` file on disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    /// Base64 torrent file contents; wins over `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(flatten)]
    options: AddOptionParams,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct AddMagnetParams {
    uri: String,
    #[serde(flatten)]
    options: AddOptionParams,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct GidParams {
    gid: String,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct RemoveParams {
    gid: String,
    #[serde(default)]
    delete_files: bool,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct SpeedLimitParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<String>,
    #[serde(default)]
    download: u64,
    #[serde(default)]
    upload: u64,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct SetPriorityParams {
    gid: String,
    priority: Priority,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct ParseMagnetParams {
    uri: String,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct SelectFilesParams {
    gid: String,
    files: Vec<usize>,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct UpdateSettingsParams {
    settings: Value,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct BoolParams {
    value: bool,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct UserAgentParams {
    user_agent: String,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct TrackerListParams {
    trackers: Vec<String>,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct ScheduleRulesParams {
    rules: Vec<ScheduleRule>,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct DbKeyParams {
    key: String,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct DbSetParams {
    key: String,
    value: String,
}

// ---------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------

/// Executes one method against the controller.
///
/// # Errors
///
/// [`RpcError`] with `method_not_found`, `invalid_params`, or an
/// application code derived from the engine error taxonomy.
pub async fn dispatch(
    controller: &Controller,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    let method = Method::from_str(method).map_err(|()| RpcError::method_not_found(method))?;
    let strict = controller.config().rpc_strict_params;

    match method {
        Method::AddDownload => {
            let p: AddDownloadParams = parse(params, strict)?;
            let gid = controller.add_url(&p.url, p.options.into()).await?;
            Ok(json!({ "gid": gid }))
        }
        Method::AddUrls => {
            let p: AddUrlsParams = parse(params, strict)?;
            let results = controller.add_urls(&p.urls, p.options.into()).await;
            let report: Vec<Value> = results
                .into_iter()
                .zip(&p.urls)
                .map(|(result, url)| match result {
                    Ok(gid) => json!({ "url": url, "gid": gid }),
                    Err(error) => json!({ "url": url, "error": error.message }),
                })
                .collect();
            Ok(json!({ "results": report }))
        }
        Method::AddTorrentFile => {
            let p: TorrentFileParams = parse(params, strict)?;
            let blob = torrent_blob(&p)?;
            let gid = controller.add_torrent_blob(blob, p.options.into()).await?;
            Ok(json!({ "gid": gid }))
        }
        Method::AddMagnet => {
            let p: AddMagnetParams = parse(params, strict)?;
            let gid = controller.add_magnet(&p.uri, p.options.into()).await?;
            Ok(json!({ "gid": gid }))
        }
        Method::PauseDownload => {
            let p: GidParams = parse(params, strict)?;
            controller.pause(&gid(&p.gid)?).await?;
            Ok(json!({ "ok": true }))
        }
        Method::PauseAll => {
            require_empty(&params, strict)?;
            controller.pause_all().await;
            Ok(json!({ "ok": true }))
        }
        Method::ResumeDownload => {
            let p: GidParams = parse(params, strict)?;
            controller.resume(&gid(&p.gid)?).await?;
            Ok(json!({ "ok": true }))
        }
        Method::ResumeAll => {
            require_empty(&params, strict)?;
            controller.resume_all().await;
            Ok(json!({ "ok": true }))
        }
        Method::RemoveDownload => {
            let p: RemoveParams = parse(params, strict)?;
            controller.remove(&gid(&p.gid)?, p.delete_files).await?;
            Ok(json!({ "ok": true }))
        }
        Method::GetDownloadStatus => {
            let p: GidParams = parse(params, strict)?;
            let status = controller.status(&gid(&p.gid)?)?;
            to_value(&status)
        }
        Method::GetAllDownloads => {
            require_empty(&params, strict)?;
            to_value(&controller.all())
        }
        Method::GetActiveDownloads => {
            require_empty(&params, strict)?;
            to_value(&controller.active())
        }
        Method::GetGlobalStats => {
            require_empty(&params, strict)?;
            to_value(&controller.global_stats())
        }
        Method::SetSpeedLimit => {
            let p: SpeedLimitParams = parse(params, strict)?;
            let id = p.gid.as_deref().map(gid).transpose()?;
            controller.set_speed_limit(id.as_ref(), p.download, p.upload).await?;
            Ok(json!({ "ok": true }))
        }
        Method::SetPriority => {
            let p: SetPriorityParams = parse(params, strict)?;
            controller.set_priority(&gid(&p.gid)?, p.priority).await?;
            Ok(json!({ "ok": true }))
        }
        Method::ParseTorrentFile => {
            let p: TorrentFileParams = parse(params, strict)?;
            let blob = torrent_blob(&p)?;
            let meta = Metainfo::from_bytes(&blob)
                .map_err(|e| RpcError::invalid_params(format!("torrent file: {e}")))?;
            Ok(torrent_summary(&meta))
        }
        Method::ParseMagnetUri => {
            let p: ParseMagnetParams = parse(params, strict)?;
            let link = MagnetLink::parse(&p.uri)
                .map_err(|e| RpcError::invalid_params(format!("magnet: {e}")))?;
            Ok(json!({
                "infoHash": link.info_hash_hex(),
                "name": link.display_name,
                "trackers": link.trackers,
                "webSeeds": link.web_seeds,
                "exactLength": link.exact_length,
            }))
        }
        Method::GetPeers => {
            let p: GidParams = parse(params, strict)?;
            to_value(&controller.peers(&gid(&p.gid)?).await?)
        }
        Method::GetTorrentFiles => {
            let p: GidParams = parse(params, strict)?;
            to_value(&controller.torrent_files(&gid(&p.gid)?).await?)
        }
        Method::SelectTorrentFiles => {
            let p: SelectFilesParams = parse(params, strict)?;
            controller.select_torrent_files(&gid(&p.gid)?, p.files).await?;
            Ok(json!({ "ok": true }))
        }
        Method::GetSettings => {
            require_empty(&params, strict)?;
            to_value(&controller.config())
        }
        Method::UpdateSettings => {
            let p: UpdateSettingsParams = parse(params, strict)?;
            let updated = controller.update_settings(p.settings).await?;
            to_value(&updated)
        }
        Method::SetCloseToTray => {
            let p: BoolParams = parse(params, strict)?;
            controller.set_close_to_tray(p.value).await;
            Ok(json!({ "ok": true }))
        }
        Method::SetUserAgent => {
            let p: UserAgentParams = parse(params, strict)?;
            controller.set_user_agent(&p.user_agent).await?;
            Ok(json!({ "ok": true }))
        }
        Method::GetTrackerList => {
            require_empty(&params, strict)?;
            Ok(json!({ "trackers": controller.tracker_list() }))
        }
        Method::UpdateTrackerList => {
            let p: TrackerListParams = parse(params, strict)?;
            controller.set_tracker_list(p.trackers).await;
            Ok(json!({ "ok": true }))
        }
        Method::ApplySettingsToEngine => {
            require_empty(&params, strict)?;
            controller.apply_settings().await?;
            Ok(json!({ "ok": true }))
        }
        Method::GetUserAgentPresets => {
            require_empty(&params, strict)?;
            let presets: Vec<Value> = UA_PRESETS
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect();
            Ok(json!({ "presets": presets }))
        }
        Method::GetEngineVersion => {
            require_empty(&params, strict)?;
            Ok(json!({ "version": env!("CARGO_PKG_VERSION") }))
        }
        Method::GetDefaultDownloadPath => {
            require_empty(&params, strict)?;
            Ok(json!({ "path": controller.config().download_dir }))
        }
        Method::GetScheduleRules => {
            require_empty(&params, strict)?;
            let rules = load_schedule_rules(controller).await;
            to_value(&rules)
        }
        Method::SetScheduleRules => {
            let p: ScheduleRulesParams = parse(params, strict)?;
            let json = serde_json::to_string(&p.rules)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            controller
                .store()
                .set_setting("schedule_rules", &json)
                .await
                .map_err(storage_error)?;
            Ok(json!({ "ok": true }))
        }
        Method::DbGet => {
            let p: DbKeyParams = parse(params, strict)?;
            let value = controller.store().get_setting(&p.key).await.map_err(storage_error)?;
            Ok(json!({ "value": value }))
        }
        Method::DbSet => {
            let p: DbSetParams = parse(params, strict)?;
            controller
                .store()
                .set_setting(&p.key, &p.value)
                .await
                .map_err(storage_error)?;
            Ok(json!({ "ok": true }))
        }
        Method::DbDelete => {
            let p: DbKeyParams = parse(params, strict)?;
            controller.store().delete_setting(&p.key).await.map_err(storage_error)?;
            Ok(json!({ "ok": true }))
        }
        Method::DbList => {
            require_empty(&params, strict)?;
            let entries: Vec<Value> = controller
                .store()
                .list_settings()
                .await
                .map_err(storage_error)?
                .into_iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect();
            Ok(json!({ "entries": entries }))
        }
    }
}

/// Reads the schedule rules from the settings table.
pub async fn load_schedule_rules(controller: &Controller) -> Vec<ScheduleRule> {
    match controller.store().get_setting("schedule_rules").await {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse<T: DeserializeOwned + Serialize>(params: Value, strict: bool) -> Result<T, RpcError> {
    let incoming_keys: Vec<String> = match &params {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Null => Vec::new(),
        _ => return Err(RpcError::invalid_params("params must be an object")),
    };

    let parsed: T = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(e.to_string()))?;

    if strict {
        // Compare against the schema's own key set: anything the schema
        // does not round-trip is unknown.
        let known = serde_json::to_value(&parsed)
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        if let Value::Object(known) = known {
            for key in incoming_keys {
                if !known.contains_key(&key) && !optional_key(&key) {
                    return Err(RpcError::invalid_params(format!("unknown field: {key}")));
                }
            }
        }
    }
    Ok(parsed)
}

/// Optional fields skipped during serialization still count as known.
///
/// The parameter structs skip `None` options on serialize, so a client
/// sending an explicit null for a known optional field must not be
/// rejected. The option names are shared across the `add_*` methods.
fn optional_key(key: &str) -> bool {
    matches!(
        key,
        "dir" | "filename"
            | "headers"
            | "user_agent"
            | "referrer"
            | "checksum"
            | "priority"
            | "sequential"
            | "path"
            | "data"
            | "gid"
            | "download"
            | "upload"
            | "delete_files"
    )
}

fn require_empty(params: &Value, strict: bool) -> Result<(), RpcError> {
    match params {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() || !strict => Ok(()),
        Value::Object(map) => Err(RpcError::invalid_params(format!(
            "method takes no parameters, got: {}",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ))),
        _ => Err(RpcError::invalid_params("params must be an object")),
    }
}

fn gid(raw: &str) -> Result<DownloadId, RpcError> {
    DownloadId::parse(raw).map_err(RpcError::invalid_params)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn storage_error(error: crate::storage::StorageError) -> RpcError {
    RpcError::from(EngineError::fatal(crate::error::ErrorKind::Unknown, error.to_string()))
}

fn torrent_blob(params: &TorrentFileParams) -> Result<Vec<u8>, RpcError> {
    if let Some(data) = &params.data {
        return decode_torrent_data(data).map_err(|e| RpcError::invalid_params(e.message));
    }
    if let Some(path) = &params.path {
        return std::fs::read(path)
            .map_err(|e| RpcError::invalid_params(format!("reading {}: {e}", path.display())));
    }
    Err(RpcError::invalid_params("either path or data is required"))
}

fn torrent_summary(meta: &Metainfo) -> Value {
    let files: Vec<Value> = meta
        .files
        .iter()
        .map(|file| json!({ "path": file.path, "length": file.length }))
        .collect();
    json!({
        "infoHash": meta.info_hash_hex(),
        "name": meta.name,
        "totalSize": meta.total_size,
        "pieceLength": meta.piece_length,
        "pieceCount": meta.piece_count(),
        "files": files,
        "trackers": meta.trackers,
        "private": meta.private,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_method_set_is_closed() {
        assert!(Method::from_str("add_download").is_ok());
        assert!(Method::from_str("db_list").is_ok());
        assert!(Method::from_str("shutdown").is_err());
        assert!(Method::from_str("").is_err());
        assert!(Method::from_str("ADD_DOWNLOAD").is_err());
    }

    #[test]
    fn test_parse_lenient_ignores_unknown_fields() {
        let params = json!({ "gid": "0123456789abcdef", "extra": true });
        let parsed: GidParams = parse(params, false).unwrap();
        assert_eq!(parsed.gid, "0123456789abcdef");
    }

    #[test]
    fn test_parse_strict_rejects_unknown_fields() {
        let params = json!({ "gid": "0123456789abcdef", "bogus_field": true });
        let err = parse::<GidParams>(params, true).unwrap_err();
        assert!(err.message.contains("bogus_field"));
    }

    #[test]
    fn test_parse_missing_required_field() {
        let err = parse::<GidParams>(json!({}), false).unwrap_err();
        assert_eq!(err.code, super::super::protocol::CODE_INVALID_PARAMS);
    }

    #[test]
    fn test_add_download_params_flatten_options() {
        let params = json!({
            "url": "https://example.com/f.iso",
            "dir": "/data",
            "checksum": "sha256:aa",
            "priority": "high",
            "sequential": true,
        });
        let parsed: AddDownloadParams = parse(params, false).unwrap();
        assert_eq!(parsed.url, "https://example.com/f.iso");
        assert_eq!(parsed.options.dir, Some(PathBuf::from("/data")));
        assert_eq!(parsed.options.priority, Some(Priority::High));
        assert!(parsed.options.sequential);
    }

    #[test]
    fn test_gid_validation() {
        assert!(gid("0123456789abcdef").is_ok());
        assert!(gid("nope").is_err());
    }
}

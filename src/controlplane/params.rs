//! Inbound parameter and secret validation
//!
//! Storage-class parameter keys are matched case-insensitively. Unknown keys
//! are rejected so that typos in a storage class surface at provisioning
//! time instead of silently falling back to defaults.

use super::backends::truenas::{PermissionOptions, ShareOptions};
use crate::domain::naming::{NameMetadata, DEFAULT_ARCHIVE_PREFIX};
use crate::domain::ports::{ApiKey, OnDeletePolicy};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::warn;

pub const API_KEY_SECRET: &str = "apiKey";

pub const TNS_WS_URL: &str = "tnsWsUrl";
pub const ROOT_DATASET: &str = "rootDataset";

const KEY_TNS_WS_URL: &str = "tnswsurl";
const KEY_ROOT_DATASET: &str = "rootdataset";
const KEY_ON_DELETE: &str = "ondelete";
const KEY_NAME_TEMPLATE: &str = "dsnametemplate";
const KEY_ARCHIVE_PREFIX: &str = "dsarchiveprefix";
const KEY_MOUNT_PERMISSIONS: &str = "mountpermissions";
const KEY_PERMISSIONS_MODE: &str = "dspermissionsmode";
const KEY_PERMISSIONS_USER: &str = "dspermissionsuser";
const KEY_PERMISSIONS_GROUP: &str = "dspermissionsgroup";
const KEY_MAPROOT_USER: &str = "sharemaprootuser";
const KEY_MAPROOT_GROUP: &str = "sharemaprootgroup";
const KEY_MAPALL_USER: &str = "sharemapalluser";
const KEY_MAPALL_GROUP: &str = "sharemapallgroup";
const KEY_ALLOWED_HOSTS: &str = "shareallowedhosts";
const KEY_ALLOWED_NETWORKS: &str = "shareallowednetworks";
const KEY_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
const KEY_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
const KEY_PV_NAME: &str = "csi.storage.k8s.io/pv/name";

const KNOWN_KEYS: [&str; 18] = [
    KEY_TNS_WS_URL,
    KEY_ROOT_DATASET,
    KEY_ON_DELETE,
    KEY_NAME_TEMPLATE,
    KEY_ARCHIVE_PREFIX,
    KEY_MOUNT_PERMISSIONS,
    KEY_PERMISSIONS_MODE,
    KEY_PERMISSIONS_USER,
    KEY_PERMISSIONS_GROUP,
    KEY_MAPROOT_USER,
    KEY_MAPROOT_GROUP,
    KEY_MAPALL_USER,
    KEY_MAPALL_GROUP,
    KEY_ALLOWED_HOSTS,
    KEY_ALLOWED_NETWORKS,
    KEY_PVC_NAME,
    KEY_PVC_NAMESPACE,
    KEY_PV_NAME,
];

/// Storage-class parameters with lowercased keys
#[derive(Debug, Clone, Default)]
struct Normalized(BTreeMap<String, String>);

impl Normalized {
    fn new(parameters: &BTreeMap<String, String>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (key, value) in parameters {
            let lowered = key.to_lowercase();
            if !KNOWN_KEYS.contains(&lowered.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "invalid parameter {:?} in storage class",
                    key
                )));
            }
            map.insert(lowered, value.trim().to_string());
        }
        Ok(Self(map))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn owned(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn required(&self, key: &str, display: &str) -> Result<String> {
        self.owned(key)
            .ok_or_else(|| Error::InvalidArgument(format!("{} is a required parameter", display)))
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn numeric_id(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(parameter = key, value = raw, "Ignoring non-numeric id");
                None
            }
        }
    }
}

// =============================================================================
// Appliance Parameters
// =============================================================================

/// Where a request is realised: appliance endpoint and root dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceParams {
    pub endpoint: String,
    pub root: String,
}

impl ApplianceParams {
    pub fn parse(parameters: &BTreeMap<String, String>) -> Result<Self> {
        let normalized = Normalized::new(parameters)?;
        Self::from_normalized(&normalized)
    }

    fn from_normalized(params: &Normalized) -> Result<Self> {
        Ok(Self {
            endpoint: params.required(KEY_TNS_WS_URL, TNS_WS_URL)?,
            root: params
                .required(KEY_ROOT_DATASET, ROOT_DATASET)?
                .trim_matches('/')
                .to_string(),
        })
    }
}

// =============================================================================
// Volume Parameters
// =============================================================================

/// Validated storage-class parameters for a volume create
#[derive(Debug, Clone)]
pub struct VolumeParams {
    pub appliance: ApplianceParams,
    /// `None` falls back to the driver default at delete time
    pub on_delete: Option<OnDeletePolicy>,
    pub name_template: String,
    pub archive_prefix: String,
    pub permissions: PermissionOptions,
    pub share: ShareOptions,
    pub metadata: NameMetadata,
}

impl VolumeParams {
    pub fn parse(parameters: &BTreeMap<String, String>, pv_name: &str) -> Result<Self> {
        let params = Normalized::new(parameters)?;
        let appliance = ApplianceParams::from_normalized(&params)?;

        let archive_prefix = params
            .owned(KEY_ARCHIVE_PREFIX)
            .unwrap_or_else(|| DEFAULT_ARCHIVE_PREFIX.to_string());
        if !is_valid_archive_prefix(&archive_prefix) {
            return Err(Error::FailedPrecondition(
                "Archive prefix can only contain alpha chars".to_string(),
            ));
        }

        let on_delete = match params.get(KEY_ON_DELETE) {
            None => None,
            Some(raw) => Some(parse_on_delete(raw)?),
        };

        Ok(Self {
            appliance,
            on_delete,
            name_template: params.owned(KEY_NAME_TEMPLATE).unwrap_or_default(),
            archive_prefix,
            permissions: PermissionOptions {
                mode: params.owned(KEY_PERMISSIONS_MODE),
                uid: params.numeric_id(KEY_PERMISSIONS_USER),
                gid: params.numeric_id(KEY_PERMISSIONS_GROUP),
            },
            share: ShareOptions {
                maproot_user: params.owned(KEY_MAPROOT_USER),
                maproot_group: params.owned(KEY_MAPROOT_GROUP),
                mapall_user: params.owned(KEY_MAPALL_USER),
                mapall_group: params.owned(KEY_MAPALL_GROUP),
                hosts: params.list(KEY_ALLOWED_HOSTS),
                networks: params.list(KEY_ALLOWED_NETWORKS),
            },
            metadata: NameMetadata {
                namespace: params.owned(KEY_PVC_NAMESPACE).unwrap_or_default(),
                name: params.owned(KEY_PVC_NAME).unwrap_or_default(),
                pv_name: params
                    .owned(KEY_PV_NAME)
                    .unwrap_or_else(|| pv_name.to_string()),
            },
        })
    }
}

pub fn is_valid_archive_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphabetic())
}

pub fn parse_on_delete(raw: &str) -> Result<OnDeletePolicy> {
    OnDeletePolicy::parse(raw).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "invalid value {} for OnDelete, supported values are [{}]",
            raw,
            OnDeletePolicy::SUPPORTED.join(" ")
        ))
    })
}

// =============================================================================
// Secrets
// =============================================================================

/// Extract the appliance API key from a request's secrets
pub fn api_key(secrets: &BTreeMap<String, String>) -> Result<ApiKey> {
    match secrets.get(API_KEY_SECRET) {
        Some(key) if !key.is_empty() => Ok(ApiKey::new(key.clone())),
        _ => Err(Error::FailedPrecondition(format!(
            "Secret with '{}' key not found",
            API_KEY_SECRET
        ))),
    }
}

/// Snapshot classes take no parameters
pub fn ensure_no_parameters(parameters: &BTreeMap<String, String>) -> Result<()> {
    match parameters.keys().next() {
        None => Ok(()),
        Some(key) => Err(Error::InvalidArgument(format!(
            "invalid parameter {:?} in snapshot class",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("TNSWSURL", "ws://nas.test/api/current"),
            ("rootDataset", "/tank/csi/"),
        ]
    }

    #[test]
    fn test_parse_minimal() {
        let params = VolumeParams::parse(&map(&base()), "pvc-1234").unwrap();
        assert_eq!(params.appliance.endpoint, "ws://nas.test/api/current");
        assert_eq!(params.appliance.root, "tank/csi");
        assert_eq!(params.archive_prefix, DEFAULT_ARCHIVE_PREFIX);
        assert_eq!(params.on_delete, None);
        assert_eq!(params.metadata.pv_name, "pvc-1234");
        assert_eq!(params.permissions, PermissionOptions::default());
        assert_eq!(params.share, ShareOptions::default());
    }

    #[test]
    fn test_parse_full() {
        let mut pairs = base();
        pairs.extend([
            ("onDelete", "Archive"),
            ("dsArchivePrefix", "old"),
            ("dsPermissionsMode", "0777"),
            ("dsPermissionsUser", "1000"),
            ("dsPermissionsGroup", "staff"),
            ("shareMapallUser", "root"),
            ("shareAllowedNetworks", "10.0.0.0/24, 192.168.1.0/24"),
            ("shareAllowedHosts", "a.local,b.local"),
            ("mountPermissions", "0750"),
            ("csi.storage.k8s.io/pvc/namespace", "apps"),
            ("csi.storage.k8s.io/pvc/name", "data"),
        ]);
        let params = VolumeParams::parse(&map(&pairs), "pvc-1").unwrap();

        assert_eq!(params.on_delete, Some(OnDeletePolicy::Archive));
        assert_eq!(params.archive_prefix, "old");
        assert_eq!(params.permissions.mode.as_deref(), Some("0777"));
        assert_eq!(params.permissions.uid, Some(1000));
        assert_eq!(params.permissions.gid, None);
        assert_eq!(params.share.mapall_user.as_deref(), Some("root"));
        assert_eq!(params.share.networks, vec!["10.0.0.0/24", "192.168.1.0/24"]);
        assert_eq!(params.share.hosts, vec!["a.local", "b.local"]);
        assert_eq!(params.metadata.namespace, "apps");
        assert_eq!(params.metadata.name, "data");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut pairs = base();
        pairs.push(("fsType", "nfs"));
        let err = VolumeParams::parse(&map(&pairs), "pvc-1").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("fsType"));
    }

    #[test]
    fn test_required_keys() {
        let err = VolumeParams::parse(&map(&[("rootDataset", "tank")]), "pvc-1").unwrap_err();
        assert!(err.to_string().contains("tnsWsUrl is a required parameter"));

        let err = ApplianceParams::parse(&map(&[("tnsWsUrl", "ws://nas.test/websocket")])).unwrap_err();
        assert!(err.to_string().contains("rootDataset is a required parameter"));
    }

    #[test]
    fn test_archive_prefix_must_be_alphabetic() {
        let mut pairs = base();
        pairs.push(("dsArchivePrefix", "zz-1"));
        let err = VolumeParams::parse(&map(&pairs), "pvc-1").unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(is_valid_archive_prefix("zz"));
        assert!(!is_valid_archive_prefix(""));
    }

    #[test]
    fn test_on_delete_value() {
        let mut pairs = base();
        pairs.push(("onDelete", "shred"));
        let err = VolumeParams::parse(&map(&pairs), "pvc-1").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            err.to_string(),
            "Invalid argument: invalid value shred for OnDelete, supported values are [delete retain archive]"
        );
    }

    #[test]
    fn test_api_key_secret() {
        assert_eq!(api_key(&map(&[("apiKey", "1-abc")])).unwrap().expose(), "1-abc");

        let err = api_key(&map(&[("apikey", "1-abc")])).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        let err = api_key(&map(&[("apiKey", "")])).unwrap_err();
        assert_eq!(err.to_string(), "Failed precondition: Secret with 'apiKey' key not found");
    }

    #[test]
    fn test_snapshot_parameters() {
        assert!(ensure_no_parameters(&BTreeMap::new()).is_ok());
        let err = ensure_no_parameters(&map(&[("rootDataset", "tank")])).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}

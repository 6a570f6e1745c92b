//! Firmware manifest loading and update checks
//!
//! The manifest is a JSON document listing, per subsystem, the available
//! firmware version, its short commit hash and one image per hardware
//! revision:
//!
//! ```json
//! {
//!   "manifest_version": 1,
//!   "subsystems": {
//!     "head": { "version": 2, "shortsha": "25755efd", "files_by_revision": { "c2": "head-c2.hex" } }
//!   }
//! }
//! ```

use crate::bus::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kinds of firmware image a manifest can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FirmwareUpdateType {
    Head,
    GantryX,
    GantryY,
    Gripper,
    PipettesSingle,
    PipettesMulti,
    Pipettes96,
}

impl FirmwareUpdateType {
    pub const ALL: [FirmwareUpdateType; 7] = [
        FirmwareUpdateType::Head,
        FirmwareUpdateType::GantryX,
        FirmwareUpdateType::GantryY,
        FirmwareUpdateType::Gripper,
        FirmwareUpdateType::PipettesSingle,
        FirmwareUpdateType::PipettesMulti,
        FirmwareUpdateType::Pipettes96,
    ];

    /// Subsystem name used as the manifest key
    pub fn name(self) -> &'static str {
        match self {
            FirmwareUpdateType::Head => "head",
            FirmwareUpdateType::GantryX => "gantry-x",
            FirmwareUpdateType::GantryY => "gantry-y",
            FirmwareUpdateType::Gripper => "gripper",
            FirmwareUpdateType::PipettesSingle => "pipettes-single",
            FirmwareUpdateType::PipettesMulti => "pipettes-multi",
            FirmwareUpdateType::Pipettes96 => "pipettes-96",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Hardware revision assumed when a device does not report one
    pub fn default_revision(self) -> &'static str {
        match self {
            FirmwareUpdateType::Head => "c2",
            FirmwareUpdateType::GantryX | FirmwareUpdateType::GantryY => "c1",
            FirmwareUpdateType::Gripper => "c1",
            FirmwareUpdateType::PipettesSingle | FirmwareUpdateType::PipettesMulti => "c2",
            FirmwareUpdateType::Pipettes96 => "c1",
        }
    }

    /// Image kind for a device; pipettes are told apart by their
    /// subidentifier (1 single, 2 multi, 3 96-channel)
    pub fn for_device(node: NodeId, subidentifier: u8) -> Option<Self> {
        match node.application_for() {
            NodeId::Head => Some(FirmwareUpdateType::Head),
            NodeId::GantryX => Some(FirmwareUpdateType::GantryX),
            NodeId::GantryY => Some(FirmwareUpdateType::GantryY),
            NodeId::Gripper => Some(FirmwareUpdateType::Gripper),
            NodeId::PipetteLeft | NodeId::PipetteRight => match subidentifier {
                1 => Some(FirmwareUpdateType::PipettesSingle),
                2 => Some(FirmwareUpdateType::PipettesMulti),
                3 => Some(FirmwareUpdateType::Pipettes96),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for FirmwareUpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Firmware available for one subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub update_type: FirmwareUpdateType,
    pub version: u32,
    pub shortsha: String,
    pub files_by_revision: BTreeMap<String, PathBuf>,
}

pub type FirmwareManifest = BTreeMap<FirmwareUpdateType, UpdateInfo>;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    subsystems: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    version: u32,
    shortsha: String,
    files_by_revision: BTreeMap<String, PathBuf>,
}

/// Load a manifest from disk.
///
/// A missing or unreadable manifest yields no entries. Unknown subsystems
/// and invalid entries are skipped. Relative image paths are resolved
/// against the manifest's directory.
pub fn load_firmware_manifest(path: &Path) -> FirmwareManifest {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Cannot read firmware manifest {}: {}", path.display(), e);
            return FirmwareManifest::new();
        }
    };
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    parse_firmware_manifest(&text, base)
}

/// Parse manifest text, resolving relative image paths against `base`
pub fn parse_firmware_manifest(text: &str, base: &Path) -> FirmwareManifest {
    let file: ManifestFile = match serde_json::from_str(text) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Invalid firmware manifest: {}", e);
            return FirmwareManifest::new();
        }
    };

    let mut manifest = FirmwareManifest::new();
    for (name, value) in file.subsystems {
        let Some(update_type) = FirmwareUpdateType::from_name(&name) else {
            tracing::debug!("Ignoring unknown subsystem {} in manifest", name);
            continue;
        };
        let entry: ManifestEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Ignoring invalid manifest entry for {}: {}", name, e);
                continue;
            }
        };
        let files_by_revision = entry
            .files_by_revision
            .into_iter()
            .map(|(revision, file)| {
                let file = if file.is_relative() { base.join(file) } else { file };
                (revision, file)
            })
            .collect();
        manifest.insert(
            update_type,
            UpdateInfo {
                update_type,
                version: entry.version,
                shortsha: entry.shortsha,
                files_by_revision,
            },
        );
    }
    manifest
}

/// What a node reported about its running firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub node: NodeId,
    pub version: u32,
    pub shortsha: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub subidentifier: u8,
}

impl DeviceInfo {
    /// Image kind and hardware revision to look up in the manifest
    pub fn update_type_and_revision(&self) -> Option<(FirmwareUpdateType, String)> {
        let update_type = FirmwareUpdateType::for_device(self.node, self.subidentifier)?;
        let revision = self
            .revision
            .clone()
            .unwrap_or_else(|| update_type.default_revision().to_string());
        Some((update_type, revision))
    }
}

/// Decide which nodes need new firmware.
///
/// A node needs an update when `force` is set, when it is sitting in its
/// bootloader, or when its short hash differs from the manifest's. Only
/// nodes in `targets` are considered when it is given. Nodes whose image
/// for their revision is missing are logged and left out. The result is
/// keyed by application node and holds the new version and image path.
pub fn check_firmware_updates(
    devices: &BTreeMap<NodeId, DeviceInfo>,
    manifest: &FirmwareManifest,
    targets: Option<&BTreeSet<NodeId>>,
    force: bool,
) -> BTreeMap<NodeId, (u32, PathBuf)> {
    let mut updates = BTreeMap::new();
    for (node, device) in devices {
        let app = node.application_for();
        if let Some(targets) = targets {
            if !targets.contains(&app) && !targets.contains(node) {
                continue;
            }
        }
        let Some((update_type, revision)) = device.update_type_and_revision() else {
            tracing::debug!("{} has no updatable firmware", node);
            continue;
        };
        let Some(info) = manifest.get(&update_type) else {
            tracing::debug!("No {} firmware in manifest for {}", update_type, node);
            continue;
        };

        let needed = force || node.is_bootloader() || device.shortsha != info.shortsha;
        if !needed {
            tracing::debug!("{} is up to date ({})", node, device.shortsha);
            continue;
        }

        let Some(file) = info.files_by_revision.get(&revision) else {
            tracing::warn!("No {} firmware for {} revision {}", update_type, node, revision);
            continue;
        };
        if !file.is_file() {
            tracing::warn!("Firmware file for {} not found: {}", node, file.display());
            continue;
        }
        tracing::info!(
            "{} needs update: {} -> {} (version {})",
            node,
            device.shortsha,
            info.shortsha,
            info.version
        );
        updates.insert(app, (info.version, file.clone()));
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_type_names() {
        for t in FirmwareUpdateType::ALL {
            assert_eq!(FirmwareUpdateType::from_name(t.name()), Some(t));
        }
        assert_eq!(FirmwareUpdateType::from_name("rear-panel"), None);
    }

    #[test]
    fn test_update_type_for_device() {
        assert_eq!(
            FirmwareUpdateType::for_device(NodeId::HeadBootloader, 0),
            Some(FirmwareUpdateType::Head)
        );
        assert_eq!(
            FirmwareUpdateType::for_device(NodeId::PipetteRight, 2),
            Some(FirmwareUpdateType::PipettesMulti)
        );
        assert_eq!(FirmwareUpdateType::for_device(NodeId::PipetteLeft, 0), None);
        assert_eq!(FirmwareUpdateType::for_device(NodeId::Host, 0), None);
    }

    #[test]
    fn test_revision_defaults_when_unreported() {
        let mut device = DeviceInfo {
            node: NodeId::GantryX,
            version: 1,
            shortsha: "abc".to_string(),
            revision: None,
            subidentifier: 0,
        };
        assert_eq!(
            device.update_type_and_revision(),
            Some((FirmwareUpdateType::GantryX, "c1".to_string()))
        );
        device.revision = Some("b2".to_string());
        assert_eq!(device.update_type_and_revision().unwrap().1, "b2");
    }

    #[test]
    fn test_parse_skips_bad_entries() {
        let text = r#"{
            "manifest_version": 1,
            "subsystems": {
                "head": { "version": 2, "shortsha": "25755efd", "files_by_revision": { "c2": "head-c2.hex" } },
                "gantry-x": { "version": "two" },
                "rear-panel": { "version": 2, "shortsha": "9d6b5248", "files_by_revision": {} }
            }
        }"#;
        let manifest = parse_firmware_manifest(text, Path::new("/opt/fw"));
        assert_eq!(manifest.len(), 1);
        let head = &manifest[&FirmwareUpdateType::Head];
        assert_eq!(head.version, 2);
        assert_eq!(head.files_by_revision["c2"], PathBuf::from("/opt/fw/head-c2.hex"));
    }

    fn device(node: NodeId, shortsha: &str) -> DeviceInfo {
        DeviceInfo {
            node,
            version: 1,
            shortsha: shortsha.to_string(),
            revision: None,
            subidentifier: 0,
        }
    }

    /// Manifest with head (c2) and gantry-x (c1) images on disk, plus a
    /// gantry-y entry whose only image is for another revision
    fn manifest_in(dir: &tempfile::TempDir) -> FirmwareManifest {
        std::fs::write(dir.path().join("head-c2.hex"), ":00000001FF\n").unwrap();
        std::fs::write(dir.path().join("gantry-x-c1.hex"), ":00000001FF\n").unwrap();
        let text = r#"{
            "manifest_version": 1,
            "subsystems": {
                "head": { "version": 3, "shortsha": "abc123", "files_by_revision": { "c2": "head-c2.hex" } },
                "gantry-x": { "version": 4, "shortsha": "abc123", "files_by_revision": { "c1": "gantry-x-c1.hex" } },
                "gantry-y": { "version": 5, "shortsha": "fff000", "files_by_revision": { "b1": "gantry-y-b1.hex" } }
            }
        }"#;
        parse_firmware_manifest(text, dir.path())
    }

    fn devices(list: Vec<DeviceInfo>) -> BTreeMap<NodeId, DeviceInfo> {
        list.into_iter().map(|d| (d.node, d)).collect()
    }

    #[test]
    fn test_matching_hash_needs_update_only_when_forced() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(&dir);
        let devices = devices(vec![device(NodeId::Head, "abc123")]);

        assert!(check_firmware_updates(&devices, &manifest, None, false).is_empty());

        let forced = check_firmware_updates(&devices, &manifest, None, true);
        assert_eq!(
            forced,
            BTreeMap::from([(NodeId::Head, (3, dir.path().join("head-c2.hex")))])
        );
    }

    #[test]
    fn test_differing_hash_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(&dir);
        let devices = devices(vec![
            device(NodeId::Head, "0ld5ha"),
            device(NodeId::GantryX, "abc123"),
        ]);
        let updates = check_firmware_updates(&devices, &manifest, None, false);
        assert_eq!(updates.keys().copied().collect::<Vec<_>>(), vec![NodeId::Head]);
    }

    #[test]
    fn test_bootloader_node_always_updates_under_application_id() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(&dir);
        let devices = devices(vec![device(NodeId::GantryXBootloader, "abc123")]);
        let updates = check_firmware_updates(&devices, &manifest, None, false);
        assert_eq!(
            updates,
            BTreeMap::from([(NodeId::GantryX, (4, dir.path().join("gantry-x-c1.hex")))])
        );
    }

    #[test]
    fn test_missing_image_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(&dir);

        // gantry-y defaults to revision c1, which the manifest lacks
        let devices_y = devices(vec![device(NodeId::GantryY, "0ld5ha")]);
        assert!(check_firmware_updates(&devices_y, &manifest, None, true).is_empty());

        // listed in the manifest but gone from disk
        std::fs::remove_file(dir.path().join("head-c2.hex")).unwrap();
        let devices_head = devices(vec![device(NodeId::Head, "0ld5ha")]);
        assert!(check_firmware_updates(&devices_head, &manifest, None, true).is_empty());
    }

    #[test]
    fn test_targets_limit_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_in(&dir);
        let devices = devices(vec![
            device(NodeId::Head, "0ld5ha"),
            device(NodeId::GantryXBootloader, "0ld5ha"),
        ]);

        let only_head = BTreeSet::from([NodeId::Head]);
        let updates = check_firmware_updates(&devices, &manifest, Some(&only_head), true);
        assert_eq!(updates.keys().copied().collect::<Vec<_>>(), vec![NodeId::Head]);

        // an application id also selects its bootloader
        let only_x = BTreeSet::from([NodeId::GantryX]);
        let updates = check_firmware_updates(&devices, &manifest, Some(&only_x), false);
        assert_eq!(updates.keys().copied().collect::<Vec<_>>(), vec![NodeId::GantryX]);
    }

    #[test]
    fn test_invalid_json_is_empty() {
        assert!(parse_firmware_manifest("{ not json", Path::new("")).is_empty());
        assert!(load_firmware_manifest(Path::new("/nonexistent/manifest.json")).is_empty());
    }
}

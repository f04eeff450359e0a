use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// The logical operation a request performs, recorded on its tracing span
/// (as `snake_case`, e.g. `app_create`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    #[default]
    None,
    AppCreate,
    MachineLaunch,
    MachineUpdate,
    MachineStart,
    MachineWait,
    MachineStop,
    MachineRestart,
    MachineGet,
    MachineList,
    MachineDestroy,
    MachineKill,
    MachineFindLease,
    MachineAcquireLease,
    MachineRefreshLease,
    MachineReleaseLease,
    MachineExec,
    MachinePs,
    MachineCordon,
    MachineUncordon,
    MachineSuspend,
    AppSecretsList,
    AppSecretGet,
    AppSecretSet,
    AppSecretDelete,
    SecretkeysList,
    SecretkeyGet,
    SecretkeySet,
    SecretkeyGenerate,
    SecretkeyDelete,
    SecretkeyEncrypt,
    SecretkeyDecrypt,
    SecretkeySign,
    SecretkeyVerify,
    VolumeList,
    VolumeCreate,
    VolumeUpdate,
    VolumeGet,
    VolumeSnapshotCreate,
    VolumeSnapshotList,
    VolumeExtend,
    VolumeDelete,
    MetadataSet,
    MetadataGet,
    MetadataDel,
    RegionsGet,
    PlacementPost,
    IpAssignmentsList,
    IpAssignmentCreate,
    IpAssignmentDelete,
    GetOidcToken,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn it_renders_actions_in_snake_case() {
        assert_eq!(Action::AppCreate.to_string(), "app_create");
        assert_eq!(Action::MachineAcquireLease.as_str(), "machine_acquire_lease");
        assert_eq!(Action::GetOidcToken.as_str(), "get_oidc_token");
        assert_eq!(Action::default().as_str(), "none");
    }

    #[test]
    fn it_parses_every_rendered_action() {
        for action in Action::iter() {
            let name = action.as_str();
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
            assert_eq!(Action::from_str(name), Ok(action));
        }
    }
}

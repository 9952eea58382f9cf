use crate::logging::{error, Logger};
use crate::plugin::PluginHandle;
use crate::support::{ChannelId, ChannelStatus, OpHandle, SdkResponse};
use hashbrown::HashMap;

/// Which side of a link a role is allowed to stand up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkSide {
    Creator,
    Loader,
    Both,
}

/// Named behavioral variant of a channel, chosen on activation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelRole {
    pub name: String,
    pub link_side: LinkSide,
}

impl ChannelRole {
    #[inline]
    pub fn new(name: &str, link_side: LinkSide) -> ChannelRole {
        ChannelRole {
            name: name.into(),
            link_side,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActivateChannelStatusCode {
    Ok,
    AlreadyActivated,
    ActivatedWithDifferentRole,
    InvalidState,
    InvalidRole,
    FailedToGetChannel,
    ChannelDoesNotExist,
}

struct ChannelInfo {
    status: ChannelStatus,
    roles: Vec<ChannelRole>,
    current_role: Option<ChannelRole>,
}

/// Tracks per-channel activation status and the role each channel is
/// currently activated with. Activation is idempotent per role.
pub struct ChannelManager {
    channels: HashMap<ChannelId, ChannelInfo>,
    log: Logger,
}

impl ChannelManager {
    pub fn new(registrations: &[PluginHandle], log: Logger) -> ChannelManager {
        let mut channels = HashMap::new();

        for registration in registrations {
            channels.insert(
                registration.channel_id.clone(),
                ChannelInfo {
                    status: ChannelStatus::Enabled,
                    roles: registration.roles.clone(),
                    current_role: None,
                },
            );
        }

        ChannelManager { channels, log }
    }

    /// Requests channel activation from the plugin, unless the channel is
    /// already active (with this role or another) or cannot be activated.
    pub fn activate_channel(
        &mut self,
        handle: OpHandle,
        channel_id: &ChannelId,
        role: &str,
        registration: Option<&PluginHandle>,
    ) -> ActivateChannelStatusCode {
        let info = match self.channels.get_mut(channel_id) {
            Some(info) => info,
            None => {
                error!(self.log, "channel not found";
                       "context" => "activate_channel", "channel_id" => %channel_id);
                return ActivateChannelStatusCode::ChannelDoesNotExist;
            }
        };

        match info.status {
            ChannelStatus::Enabled => (),
            ChannelStatus::Starting | ChannelStatus::Available => {
                let same_role = info
                    .current_role
                    .as_ref()
                    .map(|current| current.name == role)
                    .unwrap_or(false);

                return match same_role {
                    true => ActivateChannelStatusCode::AlreadyActivated,
                    _ => ActivateChannelStatusCode::ActivatedWithDifferentRole,
                };
            }
            _ => {
                error!(self.log, "channel in invalid state";
                       "context" => "activate_channel",
                       "channel_id" => %channel_id,
                       "status" => ?info.status);
                return ActivateChannelStatusCode::InvalidState;
            }
        }

        let requested = info.roles.iter().find(|candidate| candidate.name == role);
        let requested = match requested {
            Some(role) => role.clone(),
            None => return ActivateChannelStatusCode::InvalidRole,
        };

        let registration = match registration {
            Some(registration) => registration,
            None => return ActivateChannelStatusCode::FailedToGetChannel,
        };

        info.current_role = Some(requested);
        info.status = ChannelStatus::Starting;

        let response: SdkResponse = registration.plugin.activate_channel(handle, channel_id, role);
        match response.is_ok() {
            true => ActivateChannelStatusCode::Ok,
            _ => ActivateChannelStatusCode::FailedToGetChannel,
        }
    }

    /// Records the status the plugin reported for a channel.
    pub fn on_channel_status_changed(&mut self, channel_id: &ChannelId, status: ChannelStatus) {
        match self.channels.get_mut(channel_id) {
            Some(info) => info.status = status,
            None => {
                error!(self.log, "channel not found";
                       "context" => "on_channel_status_changed", "channel_id" => %channel_id);
            }
        }
    }

    /// Whether the given role stands up the link itself (creator side) when
    /// opening the given direction. `Both` roles create receive links and
    /// load send links, matching the usual dial pattern.
    pub fn creates_links(&self, channel_id: &ChannelId, role: &str, sending: bool) -> bool {
        let side = self
            .channels
            .get(channel_id)
            .and_then(|info| info.roles.iter().find(|candidate| candidate.name == role))
            .map(|role| role.link_side);

        match side {
            Some(LinkSide::Creator) => true,
            Some(LinkSide::Loader) => false,
            Some(LinkSide::Both) => !sending,
            None => !sending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::plugin::ChannelPlugin;
    use crate::support::{ConnId, LinkAddress, LinkId, LinkKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPlugin {
        activations: AtomicUsize,
    }

    impl ChannelPlugin for CountingPlugin {
        fn activate_channel(&self, _: OpHandle, _: &ChannelId, _: &str) -> SdkResponse {
            self.activations.fetch_add(1, Ordering::SeqCst);
            SdkResponse::ok()
        }
        fn create_link(&self, _: OpHandle, _: &ChannelId) -> SdkResponse {
            SdkResponse::ok()
        }
        fn load_link_address(&self, _: OpHandle, _: &ChannelId, _: &LinkAddress) -> SdkResponse {
            SdkResponse::ok()
        }
        fn load_link_addresses(&self, _: OpHandle, _: &ChannelId, _: &[LinkAddress]) -> SdkResponse {
            SdkResponse::ok()
        }
        fn create_link_from_address(
            &self,
            _: OpHandle,
            _: &ChannelId,
            _: &LinkAddress,
        ) -> SdkResponse {
            SdkResponse::ok()
        }
        fn create_bootstrap_link(&self, _: OpHandle, _: &ChannelId, _: &str) -> SdkResponse {
            SdkResponse::ok()
        }
        fn open_connection(
            &self,
            _: OpHandle,
            _: LinkKind,
            _: &LinkId,
            _: &str,
            _: u64,
        ) -> SdkResponse {
            SdkResponse::ok()
        }
        fn send_package(&self, _: OpHandle, _: &ConnId, _: Vec<u8>, _: f64, _: u64) -> SdkResponse {
            SdkResponse::ok()
        }
        fn close_connection(&self, _: OpHandle, _: &ConnId) -> SdkResponse {
            SdkResponse::ok()
        }
        fn destroy_link(&self, _: OpHandle, _: &LinkId) -> SdkResponse {
            SdkResponse::ok()
        }
        fn deactivate_channel(&self, _: OpHandle, _: &ChannelId) -> SdkResponse {
            SdkResponse::ok()
        }
    }

    fn registration() -> PluginHandle {
        PluginHandle::new(
            "testChannel",
            vec![
                ChannelRole::new("creatorRole", LinkSide::Creator),
                ChannelRole::new("loaderRole", LinkSide::Loader),
            ],
            Arc::new(CountingPlugin {
                activations: AtomicUsize::new(0),
            }),
        )
    }

    #[test]
    fn test_activation_states() {
        let registration = registration();
        let mut manager =
            ChannelManager::new(std::slice::from_ref(&registration), logging::child(None));
        let channel = "testChannel".to_string();

        let code = manager.activate_channel(1, &channel, "creatorRole", Some(&registration));
        assert_eq!(code, ActivateChannelStatusCode::Ok);

        // Same role is idempotent, another role is rejected.
        let code = manager.activate_channel(2, &channel, "creatorRole", Some(&registration));
        assert_eq!(code, ActivateChannelStatusCode::AlreadyActivated);
        let code = manager.activate_channel(3, &channel, "loaderRole", Some(&registration));
        assert_eq!(code, ActivateChannelStatusCode::ActivatedWithDifferentRole);
    }

    #[test]
    fn test_unknown_channel_and_role() {
        let registration = registration();
        let mut manager =
            ChannelManager::new(std::slice::from_ref(&registration), logging::child(None));

        let code = manager.activate_channel(
            1,
            &"missing".to_string(),
            "creatorRole",
            Some(&registration),
        );
        assert_eq!(code, ActivateChannelStatusCode::ChannelDoesNotExist);

        let code = manager.activate_channel(
            1,
            &"testChannel".to_string(),
            "badRole",
            Some(&registration),
        );
        assert_eq!(code, ActivateChannelStatusCode::InvalidRole);
    }

    #[test]
    fn test_link_side_drives_creation() {
        let registration = registration();
        let manager =
            ChannelManager::new(std::slice::from_ref(&registration), logging::child(None));
        let channel = "testChannel".to_string();

        assert!(manager.creates_links(&channel, "creatorRole", true));
        assert!(manager.creates_links(&channel, "creatorRole", false));
        assert!(!manager.creates_links(&channel, "loaderRole", true));
        assert!(!manager.creates_links(&channel, "loaderRole", false));
    }
}

//! Business modules.
//!
//! Each module contributes an immutable descriptor (actions, embedded
//! schema document) and two handler variants: `openwrt` writes the real
//! uci store and invokes real scripts, `mock` keeps in-memory state for
//! tests. The variant is selected once at startup through
//! [`build`]; switching requires a restart.

pub mod about;
pub mod dns;
pub mod remote;
pub mod subordinates;
pub mod web;

use std::sync::Arc;

use foris_core::env;

use crate::registry::{ModuleHandler, RegistryError};
use crate::state::{Backend, DaemonContext};

/// All module names this build knows, in registration order.
pub const MODULE_NAMES: &[&str] = &["about", "dns", "remote", "subordinates", "web"];

/// Instantiate the handler set for the chosen deployment variant.
///
/// `filter` restricts the set (CLI `--modules`); naming an unknown
/// module is a startup error. A filter entry equal to the default
/// updater module name is translated through the `FC_UPDATER_MODULE`
/// override so test deployments can substitute their updater backend.
pub fn build(
    context: &Arc<DaemonContext>,
    filter: Option<&[String]>,
) -> Result<Vec<Box<dyn ModuleHandler>>, RegistryError> {
    let selected: Vec<&str> = match filter {
        None => MODULE_NAMES.to_vec(),
        Some(names) => {
            let updater_override = env::updater_module_name();
            let mut selected = Vec::new();
            for name in names {
                let name = if name == env::DEFAULT_UPDATER_MODULE {
                    updater_override.clone()
                } else {
                    name.clone()
                };
                let known = MODULE_NAMES
                    .iter()
                    .copied()
                    .find(|known| *known == name)
                    .ok_or_else(|| RegistryError::UnknownFilteredModule(name.clone()))?;
                selected.push(known);
            }
            selected
        }
    };

    let mut handlers: Vec<Box<dyn ModuleHandler>> = Vec::new();
    for name in selected {
        let handler: Box<dyn ModuleHandler> = match (name, context.backend) {
            ("about", Backend::Openwrt) => Box::new(about::OpenwrtAbout::new(context)),
            ("about", Backend::Mock) => Box::new(about::MockAbout::new(context)),
            ("dns", Backend::Openwrt) => Box::new(dns::OpenwrtDns::new(context)),
            ("dns", Backend::Mock) => Box::new(dns::MockDns::new(context)),
            ("remote", Backend::Openwrt) => Box::new(remote::OpenwrtRemote::new(context)),
            ("remote", Backend::Mock) => Box::new(remote::MockRemote::new(context)),
            ("subordinates", Backend::Openwrt) => {
                Box::new(subordinates::SubordinatesModule::openwrt(context))
            }
            ("subordinates", Backend::Mock) => {
                Box::new(subordinates::SubordinatesModule::mock(context))
            }
            ("web", Backend::Openwrt) => Box::new(web::OpenwrtWeb::new(context)),
            ("web", Backend::Mock) => Box::new(web::MockWeb::new(context)),
            _ => unreachable!("module names are drawn from MODULE_NAMES"),
        };
        handlers.push(handler);
    }
    Ok(handlers)
}

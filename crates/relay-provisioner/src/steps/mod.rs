use crate::config::Flow;
use crate::executor::Step;

pub mod firewall;
pub mod hardening;
pub mod nginx;
pub mod os_check;
pub mod swap;
pub mod tunnel;

/// The fixed, ordered step sequence for a flow. There is deliberately no
/// dependency graph here: order is the contract.
pub fn flow_steps(flow: Flow) -> Vec<Box<dyn Step>> {
    match flow {
        Flow::Proxy => vec![
            Box::new(os_check::OsCheckStep),
            Box::new(swap::SwapProvisionStep),
            Box::new(swap::SwapPersistStep),
            Box::new(hardening::HardeningStep),
            Box::new(firewall::FirewallStep),
            Box::new(nginx::NginxInstallStep),
            Box::new(nginx::NginxStreamEnableStep),
            Box::new(nginx::NginxStreamRenderStep),
            Box::new(nginx::NginxReloadStep),
        ],
        Flow::Tunnel => vec![
            Box::new(os_check::OsCheckStep),
            Box::new(tunnel::CloudflaredInstallStep),
            Box::new(tunnel::CloudflaredLoginStep),
            Box::new(tunnel::TunnelCreateStep),
            Box::new(tunnel::TunnelConfigRenderStep),
            Box::new(tunnel::TunnelTestStep),
            Box::new(tunnel::TunnelServiceStep),
        ],
    }
}

pub mod channel;
pub mod external;
pub mod native;
pub mod streamlocal;
pub mod template;

use std::sync::Arc;

use tracing::info;

use sshsock_traits::config::{ConfigError, SshClient, TunnelConfig};
use sshsock_traits::ssh::TransportFactory;

use crate::external::ExternalFactory;
use crate::native::NativeFactory;

/// Picks the transport implementation the resolved configuration asks for.
pub fn transport_factory(config: &TunnelConfig) -> Result<Arc<dyn TransportFactory>, ConfigError> {
    match &config.client {
        SshClient::Native(credentials) => {
            info!("Using built-in ssh client for {}", config.ssh);
            Ok(Arc::new(NativeFactory::new(config, credentials)?))
        }
        SshClient::External(client) => {
            info!("Using external ssh client: {}", client.template);
            Ok(Arc::new(ExternalFactory::new(config, client)?))
        }
    }
}

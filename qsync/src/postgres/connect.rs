use qsync_config::shared::PgConnectionConfig;
use secrecy::ExposeSecret;
use tokio_postgres::Config;

use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;

/// Builds the connect options of the provider from its location, a libpq connection
/// string or URL as stored in the subscriber's node metadata.
///
/// Locations usually leave out the credentials, in which case the subscriber's user and
/// password are used.
pub fn provider_connect_options(
    location: &str,
    subscriber: &PgConnectionConfig,
) -> SyncResult<Config> {
    let mut config: Config = location.parse().map_err(|err: tokio_postgres::Error| {
        sync_error!(
            ErrorKind::ConfigError,
            "Provider location is not a valid connection string",
            err
        )
    })?;

    if config.get_user().is_none() {
        config.user(subscriber.username.clone());
    }
    if config.get_password().is_none()
        && let Some(password) = &subscriber.password
    {
        config.password(password.expose_secret());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_config::shared::TlsConfig;

    fn subscriber() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "subscriber.local".to_owned(),
            port: 5432,
            name: "subdb".to_owned(),
            username: "replicator".to_owned(),
            password: Some("secret".to_owned().into()),
            tls: TlsConfig::default(),
        }
    }

    #[test]
    fn test_location_without_credentials_inherits_them() {
        let config =
            provider_connect_options("host=provider.local port=6432 dbname=provdb", &subscriber())
                .unwrap();

        assert_eq!(config.get_dbname(), Some("provdb"));
        assert_eq!(config.get_ports(), &[6432]);
        assert_eq!(config.get_user(), Some("replicator"));
        assert_eq!(config.get_password(), Some("secret".as_bytes()));
    }

    #[test]
    fn test_location_credentials_win() {
        let config = provider_connect_options(
            "postgresql://owner:pw@provider.local/provdb",
            &subscriber(),
        )
        .unwrap();

        assert_eq!(config.get_user(), Some("owner"));
        assert_eq!(config.get_password(), Some("pw".as_bytes()));
    }

    #[test]
    fn test_invalid_location() {
        let err = provider_connect_options("host=a port=notaport", &subscriber()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}

//! Checks that serde cannot express.

use super::error::{ConfigError, ConfigResult};
use super::schema::{BrokerConfig, CourierConfig, LogOutput, MessagingConfig};
use courier_broker::topology::validate_topic_pattern;

pub fn validate_config(config: &CourierConfig) -> ConfigResult<()> {
    validate_messaging(&config.messaging)?;

    if config.logging.output == LogOutput::File && config.logging.file_path.is_none() {
        return Err(ConfigError::Missing("logging.file_path"));
    }

    config
        .brokers
        .iter()
        .try_for_each(|(name, broker)| validate_broker(name, broker))
}

fn validate_messaging(messaging: &MessagingConfig) -> ConfigResult<()> {
    if messaging.default_content_type.trim().is_empty() {
        return Err(ConfigError::Missing("messaging.default_content_type"));
    }
    if messaging.rpc_timeout_ms == 0 {
        return Err(ConfigError::invalid("messaging", "rpc_timeout_ms must be positive"));
    }
    Ok(())
}

fn validate_broker(name: &str, broker: &BrokerConfig) -> ConfigResult<()> {
    let section = format!("brokers.{name}");

    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(section, "broker names must be non-empty words"));
    }
    if broker.scheme().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            broker: name.to_string(),
            url: broker.url.clone(),
        });
    }
    if broker.reconnect_interval_ms == 0 {
        return Err(ConfigError::invalid(section, "reconnect_interval_ms must be positive"));
    }
    if broker.session_pool_size == 0 {
        return Err(ConfigError::invalid(section, "session_pool_size must be positive"));
    }

    if let Some(exchange) = broker
        .exchanges
        .iter()
        .find_map(|(exchange, settings)| (settings.rpc_timeout_ms == Some(0)).then_some(exchange))
    {
        return Err(ConfigError::invalid(
            format!("{section}.exchanges.{exchange}"),
            "rpc_timeout_ms must be positive",
        ));
    }

    for (queue, settings) in &broker.queues {
        let queue_section = || format!("{section}.queues.{queue}");
        if settings.clear_route_keys && !settings.route_keys.is_empty() {
            return Err(ConfigError::invalid(
                queue_section(),
                "clear_route_keys cannot be combined with route_keys",
            ));
        }
        for key in &settings.route_keys {
            validate_topic_pattern(key).map_err(|e| ConfigError::invalid(queue_section(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::topology::{ExchangeSettings, QueueSettings};

    fn with_broker(broker: BrokerConfig) -> CourierConfig {
        let mut config = CourierConfig::default();
        config.brokers.insert("main".into(), broker);
        config
    }

    #[test]
    fn test_validate_empty_config() {
        assert!(validate_config(&CourierConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_broker_url() {
        let config = with_broker(BrokerConfig {
            url: "localhost".into(),
            ..Default::default()
        });
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { broker, .. }) if broker == "main"
        ));
    }

    #[test]
    fn test_validate_zero_rpc_timeout() {
        let mut config = CourierConfig::default();
        config.messaging.rpc_timeout_ms = 0;
        assert!(validate_config(&config).is_err());

        let mut broker = BrokerConfig::default();
        broker.exchanges.insert(
            "pricing".into(),
            ExchangeSettings {
                rpc_timeout_ms: Some(0),
                ..Default::default()
            },
        );
        let err = validate_config(&with_broker(broker)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "brokers.main.exchanges.pricing: rpc_timeout_ms must be positive"
        );
    }

    #[test]
    fn test_validate_route_key_settings() {
        let mut broker = BrokerConfig::default();
        broker.queues.insert(
            "ship".into(),
            QueueSettings {
                route_keys: vec!["orders..placed".into()],
                ..Default::default()
            },
        );

        assert!(matches!(
            validate_config(&with_broker(broker)),
            Err(ConfigError::Invalid { section, .. }) if section == "brokers.main.queues.ship"
        ));
    }

    #[test]
    fn test_file_output_requires_path() {
        let mut config = CourierConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Missing("logging.file_path"))
        ));
    }
}

use thiserror::Error;

use super::models::{Config, StoreProvider};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("store bucket must not be empty")]
    EmptyBucket,

    #[error("worker tool_bin must not be empty")]
    EmptyToolBin,

    #[error("s3 provider requires an endpoint or a region")]
    MissingS3Location,
}

pub fn validate(config: &Config) -> Result<(), ValidationError> {
    if config.dispatcher.poll_interval_secs == 0 {
        return Err(ValidationError::ZeroInterval("dispatcher.poll_interval_secs"));
    }
    if config.worker.poll_interval_secs == 0 {
        return Err(ValidationError::ZeroInterval("worker.poll_interval_secs"));
    }
    if config.worker.tool_timeout_secs == 0 {
        return Err(ValidationError::ZeroInterval("worker.tool_timeout_secs"));
    }

    if config.store.bucket.is_empty() {
        return Err(ValidationError::EmptyBucket);
    }

    if config.worker.tool_bin.is_empty() {
        return Err(ValidationError::EmptyToolBin);
    }

    if config.store.provider == StoreProvider::S3
        && config.store.endpoint.is_none()
        && config.store.region.is_none()
    {
        return Err(ValidationError::MissingS3Location);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.worker.poll_interval_secs = 0;
        assert_eq!(
            validate(&config).unwrap_err(),
            ValidationError::ZeroInterval("worker.poll_interval_secs")
        );
    }

    #[test]
    fn rejects_s3_without_location() {
        let mut config = Config::default();
        config.store.provider = StoreProvider::S3;
        assert_eq!(validate(&config).unwrap_err(), ValidationError::MissingS3Location);

        config.store.region = Some("auto".to_string());
        assert!(validate(&config).is_ok());
    }
}

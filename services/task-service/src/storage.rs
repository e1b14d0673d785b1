use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};

use crate::error::StorageError;

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    pub region: String,
    pub force_path_style: bool,
}

#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    pub async fn new(config: StorageConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region));
        if let (Some(access_key), Some(secret_key)) = (config.access_key, config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "issuebank",
            ));
        }
        if let Some(endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|service_err| service_err.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(StorageError(format!("head object failed: {err}")))
                }
            }
        }
    }

    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        sha256: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .content_type("application/zip")
            .metadata("sha256", sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StorageError(format!("put object failed: {err}")))?;
        Ok(())
    }

    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        let exists = self
            .client
            .head_bucket()
            .bucket(self.bucket.as_str())
            .send()
            .await
            .is_ok();
        if !exists {
            self.client
                .create_bucket()
                .bucket(self.bucket.as_str())
                .send()
                .await
                .map_err(|err| StorageError(format!("create bucket failed: {err}")))?;
        }
        Ok(())
    }
}

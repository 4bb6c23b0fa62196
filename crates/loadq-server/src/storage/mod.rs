use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use tracing::{debug, info, instrument};

pub mod config;
pub mod memory;

pub use memory::MemoryObjectStore;

/// Bucket-addressed object access used for manifests and loader config.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;
}

/// S3 client shared by every bucket the loader touches.
#[derive(Clone)]
pub struct Storage {
    client: Client,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!(
            region = %config.region,
            endpoint = ?config.endpoint,
            path_style = config.path_style,
            "Initializing storage"
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials =
                Credentials::new(access_key, secret_key, None, None, "loadq-storage");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            if let Some(provider) = shared.credentials_provider() {
                s3_config_builder = s3_config_builder.credentials_provider(provider);
            }
        }

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "Storage client initialized");

        Ok(Self { client })
    }

    #[instrument(skip(self, data))]
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", bucket, key))?;

        info!("Uploaded s3://{}/{}", bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading s3://{}/{}", bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{}", bucket, key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    /// Check that `bucket` is reachable with the configured credentials.
    #[instrument(skip(self))]
    pub async fn check_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Bucket {} is not reachable: {}", bucket, e))
    }
}

#[async_trait]
impl ObjectStore for Storage {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.download(bucket, key).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.upload(bucket, key, data, content_type).await
    }
}

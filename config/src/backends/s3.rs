//! S3 backend.
//!
//! Maps relative paths to object keys `<folder>/<path>` in a bucket. The
//! bucket is created on first write if it does not exist, and a missing
//! object reads as `BackendFileNotFound` so the reconciliation layer can
//! treat an empty origin as "no origin yet".
//!
//! The store contract is blocking, so the async AWS SDK is driven through
//! a private current-thread runtime; every call runs to completion before
//! returning.

use crate::backends::UrlParts;
use crate::error::Result;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use relib::{Backend, Error};
use tracing::debug;

/// Backend storing the table set under an S3 prefix.
pub struct S3Backend {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_s3::Client,
    bucket_name: String,
    folder_name: String,
    region_name: Option<String>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket_name", &self.bucket_name)
            .field("folder_name", &self.folder_name)
            .field("region_name", &self.region_name)
            .finish()
    }
}

impl S3Backend {
    /// Connect to `bucket_name`, keying objects under `folder_name`.
    pub fn new(bucket_name: &str, folder_name: &str, region_name: Option<&str>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Backend(format!("Can't start S3 runtime: {}", e)))?;

        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = region_name {
                loader = loader.region(Region::new(region.to_string()));
            }
            let config = loader.load().await;
            aws_sdk_s3::Client::new(&config)
        });

        Ok(Self {
            runtime,
            client,
            bucket_name: bucket_name.to_string(),
            folder_name: folder_name.trim_matches('/').to_string(),
            region_name: region_name.map(|r| r.to_string()),
        })
    }

    pub(crate) fn create_from_url_parts(parts: &UrlParts) -> Result<Box<dyn Backend>> {
        let region = parts.query.get("region").map(String::as_str);
        Ok(Box::new(Self::new(&parts.host, &parts.path, region)?))
    }

    fn key_name(&self, file_name: &str) -> String {
        if self.folder_name.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.folder_name, file_name)
        }
    }

    fn create_bucket(&self) -> relib::Result<()> {
        debug!("Creating bucket s3://{}", self.bucket_name);
        let mut request = self.client.create_bucket().bucket(&self.bucket_name);
        if let Some(region) = &self.region_name {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region.as_str()))
                    .build(),
            );
        }
        self.runtime
            .block_on(request.send())
            .map(|_| ())
            .map_err(|e| Error::Backend(format!("{}", DisplayErrorContext(&e))))
    }

    fn put_object(&self, key_name: &str, data: &[u8], try_create_bucket: bool) -> relib::Result<()> {
        let result = self.runtime.block_on(
            self.client
                .put_object()
                .bucket(&self.bucket_name)
                .key(key_name)
                .content_type("application/json")
                .body(ByteStream::from(data.to_vec()))
                .send(),
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("NoSuchBucket") && try_create_bucket => {
                self.create_bucket()?;
                self.put_object(key_name, data, false)
            }
            Err(e) => Err(Error::Backend(format!("{}", DisplayErrorContext(&e)))),
        }
    }
}

impl Backend for S3Backend {
    fn save_data(&mut self, file_name: &str, data: &[u8]) -> relib::Result<()> {
        let key_name = self.key_name(file_name);
        debug!(
            "Uploading {} bytes to s3://{}/{}",
            data.len(),
            self.bucket_name,
            key_name
        );
        self.put_object(&key_name, data, true)
    }

    fn load_data(&mut self, file_name: &str) -> relib::Result<Vec<u8>> {
        let key_name = self.key_name(file_name);
        debug!("Downloading s3://{}/{}", self.bucket_name, key_name);

        let result = self.runtime.block_on(
            self.client
                .get_object()
                .bucket(&self.bucket_name)
                .key(&key_name)
                .send(),
        );

        match result {
            Ok(output) => self
                .runtime
                .block_on(output.body.collect())
                .map(|data| data.into_bytes().to_vec())
                .map_err(|e| {
                    Error::Backend(format!("Truncated body for '{}': {}", key_name, e))
                }),
            Err(e) => {
                let missing = e.as_service_error().is_some_and(|se| se.is_no_such_key())
                    || matches!(e.code(), Some("NoSuchKey") | Some("NoSuchBucket"));
                if missing {
                    Err(Error::BackendFileNotFound(file_name.to_string()))
                } else {
                    Err(Error::Backend(format!("{}", DisplayErrorContext(&e))))
                }
            }
        }
    }

    fn get_url(&self) -> String {
        let mut url = format!("s3://{}/{}", self.bucket_name, self.folder_name);
        if let Some(region) = &self.region_name {
            url.push_str("?region=");
            url.push_str(region);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_and_url() {
        let backend = S3Backend::new("relib-test", "/first_attempt/", Some("eu-west-1")).unwrap();
        assert_eq!(backend.key_name("#tsmeta.json"), "first_attempt/#tsmeta.json");
        assert_eq!(
            backend.get_url(),
            "s3://relib-test/first_attempt?region=eu-west-1"
        );
    }

    // Exercising a live bucket is a systems test, not a unit test.
    #[test]
    #[ignore]
    fn live_roundtrip() {
        let mut backend = S3Backend::new("relib-test", "unittest", Some("eu-west-1")).unwrap();
        backend.save_data("probe.json", b"{}").unwrap();
        assert_eq!(backend.load_data("probe.json").unwrap(), b"{}");
    }
}

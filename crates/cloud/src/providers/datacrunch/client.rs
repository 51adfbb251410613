//! DataCrunch API client implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{
    CreateInstanceBody, CreateInstanceResponse, CreateSshKeyBody, ImageList, ImageResource,
    InstanceResource, OsVolumeBody, SshKeyList, SshKeyResource, TokenRequest, TokenResponse,
};
use crate::providers::traits::{
    CloudClient, CloudError, CreateInstanceRequest, Credentials, Image, Instance, InstanceState,
    LoadBalancer, LoadBalancerSpec, SshKey,
};

/// Base URL for the DataCrunch API.
pub const DEFAULT_BASE_URL: &str = "https://api.datacrunch.io/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Cached bearer token.
#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_valid(&self) -> bool {
        !self.value.is_empty() && Utc::now() < self.expires_at
    }
}

/// DataCrunch cloud client.
///
/// Cloning is cheap and clones share the cached token.
#[derive(Clone)]
pub struct DataCrunch {
    /// HTTP client.
    client: Client,
    /// API base URL, without trailing slash.
    base_url: String,
    /// OAuth2 client credentials.
    credentials: Credentials,
    /// Token obtained by the last successful authentication.
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl DataCrunch {
    /// Create a new DataCrunch client.
    ///
    /// No request is made until the first operation.
    ///
    /// # Errors
    /// Returns error if the credentials are empty or the HTTP client cannot be created.
    pub fn new(credentials: Credentials) -> Result<Self, CloudError> {
        if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
            return Err(CloudError::Config(
                "client ID and client secret are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|source| CloudError::Http {
                operation: "build HTTP client".to_string(),
                source,
            })?;

        let base_url = credentials
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            base_url,
            credentials,
            token: Arc::new(Mutex::new(None)),
        })
    }

    /// Base URL this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Return a valid bearer token, authenticating only when the cached one
    /// is missing or expired.
    async fn bearer(&self) -> Result<String, CloudError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.value.clone());
        }

        let fresh = self.authenticate().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Exchange the client credentials for an access token.
    async fn authenticate(&self) -> Result<AccessToken, CloudError> {
        const OPERATION: &str = "authenticate";

        let url = format!("{}/oauth/token", self.base_url);
        debug!(url = %url, "Requesting access token");

        let body = TokenRequest {
            grant_type: "client_credentials",
            client_id: &self.credentials.client_id,
            client_secret: &self.credentials.client_secret,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| CloudError::Http {
                operation: OPERATION.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "DataCrunch authentication rejected");
            return Err(CloudError::Auth {
                operation: OPERATION.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = Self::parse_body(OPERATION, response).await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in.max(0));
        info!(
            token_type = token.token_type.as_deref().unwrap_or("Bearer"),
            expires_in = token.expires_in,
            "Obtained DataCrunch access token"
        );

        Ok(AccessToken {
            value: token.access_token,
            expires_at,
        })
    }

    /// Send an authenticated request.
    async fn send<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, CloudError> {
        let token = self.bearer().await?;
        let url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %url, "DataCrunch request");

        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|source| CloudError::Http {
            operation: operation.to_string(),
            source,
        })
    }

    /// Make an authenticated GET request.
    async fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        resource: &str,
        path: &str,
    ) -> Result<T, CloudError> {
        let response = self
            .send::<()>(operation, Method::GET, path, None)
            .await?;
        Self::handle_response(operation, resource, response).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(
        &self,
        operation: &str,
        resource: &str,
        path: &str,
        body: &B,
    ) -> Result<T, CloudError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let response = self
            .send(operation, Method::POST, path, Some(body))
            .await?;
        Self::handle_response(operation, resource, response).await
    }

    /// Make an authenticated POST request without a body, ignoring the response body.
    async fn post_empty(
        &self,
        operation: &str,
        resource: &str,
        path: &str,
    ) -> Result<(), CloudError> {
        let response = self
            .send::<()>(operation, Method::POST, path, None)
            .await?;
        Self::expect_success(operation, resource, response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, operation: &str, resource: &str, path: &str) -> Result<(), CloudError> {
        let response = self
            .send::<()>(operation, Method::DELETE, path, None)
            .await?;
        Self::expect_success(operation, resource, response).await
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        operation: &str,
        resource: &str,
        response: Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        if status.is_success() {
            Self::parse_body(operation, response).await
        } else {
            Err(Self::status_error(operation, resource, status, response).await)
        }
    }

    async fn expect_success(
        operation: &str,
        resource: &str,
        response: Response,
    ) -> Result<(), CloudError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(operation, resource, status, response).await)
        }
    }

    async fn parse_body<T: DeserializeOwned>(
        operation: &str,
        response: Response,
    ) -> Result<T, CloudError> {
        let text = response.text().await.map_err(|source| CloudError::Http {
            operation: operation.to_string(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| {
            warn!(error = %source, body = %text, "Failed to parse response");
            CloudError::Serialization {
                operation: operation.to_string(),
                source,
            }
        })
    }

    async fn status_error(
        operation: &str,
        resource: &str,
        status: StatusCode,
        response: Response,
    ) -> CloudError {
        if status == StatusCode::NOT_FOUND {
            return CloudError::NotFound {
                operation: operation.to_string(),
                resource: resource.to_string(),
            };
        }

        CloudError::Api {
            operation: operation.to_string(),
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl CloudClient for DataCrunch {
    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, CloudError> {
        let operation = format!("create instance {}", req.name);
        info!(
            hostname = %req.name,
            instance_type = %req.instance_type,
            image = %req.image_id,
            "Creating DataCrunch instance"
        );

        // Kept for the fallback below; the body takes ownership of the request.
        let provisioning = Instance {
            id: String::new(),
            name: req.name.clone(),
            state: InstanceState::Pending,
            instance_type: req.instance_type.clone(),
            image_id: req.image_id.clone(),
            public_ip: None,
            private_ip: None,
            ssh_key_name: req.ssh_key_name.clone(),
            created_at: None,
        };

        let body = CreateInstanceBody {
            hostname: req.name,
            instance_type: req.instance_type,
            image: req.image_id,
            ssh_key: req.ssh_key_name,
            user_data: req.user_data,
            location_code: req.location,
            metadata: req.metadata,
            tags: req.tags,
            public_ip: req.public_ip,
            is_spot: req.spot_max_price.is_some(),
            spot_max_price: req.spot_max_price,
            os_volume: req.os_volume.map(|v| OsVolumeBody {
                size: v.size_gb,
                volume_type: v.volume_type,
            }),
        };

        let created: CreateInstanceResponse = self
            .post(&operation, "instances", "/instances", &body)
            .await?;
        info!(instance_id = %created.id, "DataCrunch instance created");

        // The instance exists from here on. A failed re-read must not hide its id.
        match self.get_instance(&created.id).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                warn!(
                    instance_id = %created.id,
                    error = %e,
                    "Could not read back new instance, reporting it as pending"
                );
                Ok(Instance {
                    id: created.id,
                    ..provisioning
                })
            }
        }
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        let resource: InstanceResource = self
            .get(
                &format!("get instance {id}"),
                &format!("instance {id}"),
                &format!("/instances/{id}"),
            )
            .await?;
        Ok(Instance::from(resource))
    }

    async fn delete_instance(&self, id: &str) -> Result<(), CloudError> {
        info!(instance_id = %id, "Deleting DataCrunch instance");
        self.delete(
            &format!("delete instance {id}"),
            &format!("instance {id}"),
            &format!("/instances/{id}"),
        )
        .await
    }

    async fn start_instance(&self, id: &str) -> Result<(), CloudError> {
        info!(instance_id = %id, "Starting DataCrunch instance");
        self.post_empty(
            &format!("start instance {id}"),
            &format!("instance {id}"),
            &format!("/instances/{id}/start"),
        )
        .await
    }

    async fn stop_instance(&self, id: &str) -> Result<(), CloudError> {
        info!(instance_id = %id, "Stopping DataCrunch instance");
        self.post_empty(
            &format!("stop instance {id}"),
            &format!("instance {id}"),
            &format!("/instances/{id}/stop"),
        )
        .await
    }

    async fn list_images(&self) -> Result<Vec<Image>, CloudError> {
        let list: ImageList = self.get("list images", "images", "/images").await?;
        Ok(list.images.into_iter().map(Image::from).collect())
    }

    async fn get_image(&self, id: &str) -> Result<Image, CloudError> {
        let resource: ImageResource = self
            .get(
                &format!("get image {id}"),
                &format!("image {id}"),
                &format!("/images/{id}"),
            )
            .await?;
        Ok(Image::from(resource))
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, CloudError> {
        let list: SshKeyList = self.get("list SSH keys", "ssh-keys", "/ssh-keys").await?;
        Ok(list.ssh_keys.into_iter().map(SshKey::from).collect())
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey, CloudError> {
        info!(name = %name, "Registering SSH key");
        let resource: SshKeyResource = self
            .post(
                &format!("create SSH key {name}"),
                "ssh-keys",
                "/ssh-keys",
                &CreateSshKeyBody { name, public_key },
            )
            .await?;
        Ok(SshKey::from(resource))
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<(), CloudError> {
        self.delete(
            &format!("delete SSH key {id}"),
            &format!("SSH key {id}"),
            &format!("/ssh-keys/{id}"),
        )
        .await
    }

    async fn create_load_balancer(
        &self,
        _spec: LoadBalancerSpec,
    ) -> Result<LoadBalancer, CloudError> {
        Err(CloudError::Unimplemented("load balancer creation"))
    }

    async fn get_load_balancer(&self, _id: &str) -> Result<LoadBalancer, CloudError> {
        Err(CloudError::Unimplemented("load balancer retrieval"))
    }

    async fn delete_load_balancer(&self, _id: &str) -> Result<(), CloudError> {
        Err(CloudError::Unimplemented("load balancer deletion"))
    }

    async fn update_load_balancer_targets(
        &self,
        _id: &str,
        _targets: Vec<String>,
    ) -> Result<(), CloudError> {
        Err(CloudError::Unimplemented("load balancer target update"))
    }
}

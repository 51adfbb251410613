//! Instance lookup, creation and address mapping for DataCrunchMachines.

use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use capdc_cloud::{CloudClient, CreateInstanceRequest, Instance, OsVolume};
use flate2::write::GzEncoder;
use flate2::Compression;
use kube::ResourceExt;
use tracing::debug;

use super::controller::MachineScope;
use crate::crds::capi::CLUSTER_NAME_LABEL;
use crate::crds::{DataCrunchMachine, MachineAddress, MachineAddressType, ProviderId};
use crate::tasks::store::SecretReader;
use crate::tasks::types::{CallGuard, Error, Result};

/// Tag recording the owning Cluster API machine.
pub const MACHINE_NAME_TAG: &str = "cluster.x-k8s.io/machine-name";

/// Key of the bootstrap data in the bootstrap secret.
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// The instance behind `spec.providerID`, or `None` when there is none.
///
/// An unset providerID means no instance has been created yet and makes no
/// call. A provider-side "not found" also yields `None`.
pub async fn find_instance(
    client: &dyn CloudClient,
    machine: &DataCrunchMachine,
    guard: &CallGuard,
) -> Result<Option<Instance>> {
    let Some(raw) = machine.spec.provider_id.as_deref() else {
        return Ok(None);
    };
    let provider_id =
        ProviderId::parse(raw).ok_or_else(|| Error::InvalidProviderId(raw.to_string()))?;

    let operation = format!("get instance {}", provider_id.instance_id());
    match guard
        .call(&operation, client.get_instance(provider_id.instance_id()))
        .await
    {
        Ok(instance) => Ok(Some(instance)),
        Err(e) if e.is_cloud_not_found() => {
            debug!(provider_id = %provider_id, "Instance not found");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Build the create request and launch the instance.
pub async fn create_instance(
    client: &dyn CloudClient,
    secrets: &dyn SecretReader,
    machine: &DataCrunchMachine,
    scope: &MachineScope,
    default_image: &str,
    guard: &CallGuard,
) -> Result<Instance> {
    let secret_name = scope.bootstrap_data_secret.as_deref().ok_or_else(|| {
        Error::BootstrapData("linked Machine's bootstrap.dataSecretName is not set".to_string())
    })?;
    let compress = machine.spec.uncompressed_user_data == Some(false);
    let user_data =
        bootstrap_data(secrets, &scope.namespace, secret_name, compress, guard).await?;

    let request = instance_request(machine, scope, default_image, user_data);
    debug!(
        name = %request.name,
        instance_type = %request.instance_type,
        image = %request.image_id,
        "Creating DataCrunch instance"
    );

    let operation = format!("create instance {}", request.name);
    guard
        .call_to_completion(&operation, client.create_instance(request))
        .await
}

/// Creation request for `machine`, with cluster and machine tags merged over
/// `additionalTags`.
pub fn instance_request(
    machine: &DataCrunchMachine,
    scope: &MachineScope,
    default_image: &str,
    user_data: String,
) -> CreateInstanceRequest {
    let spec = &machine.spec;
    let image = if spec.image.is_empty() {
        default_image
    } else {
        spec.image.as_str()
    };

    let mut request = CreateInstanceRequest::new(machine.name_any(), &spec.instance_type, image);
    request.ssh_key_name = (!spec.ssh_key_name.is_empty()).then(|| spec.ssh_key_name.clone());
    request.user_data = Some(user_data);
    request.location = (!scope.region.is_empty()).then(|| scope.region.clone());
    request.metadata = spec.additional_metadata.clone();
    request.tags = spec.additional_tags.clone();
    request
        .tags
        .insert(CLUSTER_NAME_LABEL.to_string(), scope.cluster_name.clone());
    request
        .tags
        .insert(MACHINE_NAME_TAG.to_string(), scope.machine_name.clone());
    request.public_ip = spec.public_ip.unwrap_or(false);
    request.spot_max_price = spec.spot.as_ref().and_then(|s| s.max_price.clone());
    request.os_volume = spec.root_volume.as_ref().map(|volume| OsVolume {
        size_gb: (volume.size > 0).then_some(volume.size),
        volume_type: (!volume.volume_type.is_empty()).then(|| volume.volume_type.clone()),
    });
    request
}

/// Read the bootstrap secret and encode it for `user_data`.
///
/// The payload is base64 encoded, gzip compressed first when `compress` is set.
pub async fn bootstrap_data(
    secrets: &dyn SecretReader,
    namespace: &str,
    secret_name: &str,
    compress: bool,
    guard: &CallGuard,
) -> Result<String> {
    let data = guard
        .call("read bootstrap data secret", secrets.read(namespace, secret_name))
        .await?
        .ok_or_else(|| {
            Error::BootstrapData(format!(
                "bootstrap data secret {namespace}/{secret_name} not found"
            ))
        })?;

    let value = data.get(BOOTSTRAP_DATA_KEY).ok_or_else(|| {
        Error::BootstrapData(format!(
            "secret {namespace}/{secret_name} is missing key {BOOTSTRAP_DATA_KEY}"
        ))
    })?;

    if compress {
        Ok(STANDARD.encode(gzip(value)?))
    } else {
        Ok(STANDARD.encode(value))
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| Error::BootstrapData(format!("failed to compress bootstrap data: {e}")))
}

/// Machine addresses for a running instance: hostname first, then the
/// private and public IPs when known.
pub fn machine_addresses(instance: &Instance) -> Vec<MachineAddress> {
    let mut addresses = vec![MachineAddress::new(
        MachineAddressType::Hostname,
        instance.name.clone(),
    )];
    if let Some(ip) = instance.private_ip.as_deref().filter(|ip| !ip.is_empty()) {
        addresses.push(MachineAddress::new(MachineAddressType::InternalIp, ip));
    }
    if let Some(ip) = instance.public_ip.as_deref().filter(|ip| !ip.is_empty()) {
        addresses.push(MachineAddress::new(MachineAddressType::ExternalIp, ip));
    }
    addresses
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Read;

    use async_trait::async_trait;
    use capdc_cloud::InstanceState;
    use flate2::read::GzDecoder;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::crds::{DataCrunchMachineSpec, SpotMachineOptions, Volume};
    use crate::tasks::cloud::SecretLocation;
    use crate::tasks::store::SecretData;

    struct OneSecret(SecretData);

    #[async_trait]
    impl SecretReader for OneSecret {
        async fn read(&self, _namespace: &str, name: &str) -> Result<Option<SecretData>> {
            Ok((name == "bootstrap").then(|| self.0.clone()))
        }
    }

    fn scope() -> MachineScope {
        MachineScope {
            cluster_name: "demo".to_string(),
            machine_name: "demo-md-0".to_string(),
            namespace: "default".to_string(),
            region: "FIN-01".to_string(),
            infrastructure_ready: true,
            bootstrap_data_secret: Some("bootstrap".to_string()),
            credentials: SecretLocation {
                namespace: "default".to_string(),
                name: "datacrunch-credentials".to_string(),
            },
        }
    }

    fn guard() -> CallGuard {
        CallGuard::new(CancellationToken::new(), Duration::from_secs(60))
    }

    fn instance(private_ip: Option<&str>, public_ip: Option<&str>) -> Instance {
        Instance {
            id: "inst-1".to_string(),
            name: "worker-0".to_string(),
            state: InstanceState::Running,
            instance_type: "1xH100".to_string(),
            image_id: "ubuntu-22.04-cuda-12.1".to_string(),
            public_ip: public_ip.map(str::to_string),
            private_ip: private_ip.map(str::to_string),
            ssh_key_name: None,
            created_at: None,
        }
    }

    #[test]
    fn request_merges_tags_and_defaults_image() {
        let mut spec = DataCrunchMachineSpec {
            instance_type: "1xH100".to_string(),
            ..DataCrunchMachineSpec::default()
        };
        spec.additional_tags = BTreeMap::from([
            ("team".to_string(), "ml".to_string()),
            (CLUSTER_NAME_LABEL.to_string(), "spoofed".to_string()),
        ]);
        spec.spot = Some(SpotMachineOptions {
            max_price: Some("1.25".to_string()),
        });
        spec.root_volume = Some(Volume {
            size: 200,
            volume_type: "NVMe".to_string(),
            ..Volume::default()
        });
        let machine = DataCrunchMachine::new("worker-0", spec);

        let request = instance_request(&machine, &scope(), "ubuntu-22.04-cuda-12.1", "data".to_string());

        assert_eq!(request.name, "worker-0");
        assert_eq!(request.image_id, "ubuntu-22.04-cuda-12.1");
        assert_eq!(request.location.as_deref(), Some("FIN-01"));
        assert_eq!(request.ssh_key_name, None);
        assert!(!request.public_ip);
        assert_eq!(request.tags.get("team").map(String::as_str), Some("ml"));
        assert_eq!(request.tags.get(CLUSTER_NAME_LABEL).map(String::as_str), Some("demo"));
        assert_eq!(request.tags.get(MACHINE_NAME_TAG).map(String::as_str), Some("demo-md-0"));
        assert_eq!(request.spot_max_price.as_deref(), Some("1.25"));
        assert_eq!(
            request.os_volume,
            Some(OsVolume {
                size_gb: Some(200),
                volume_type: Some("NVMe".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn bootstrap_data_is_base64_encoded() {
        let secrets = OneSecret(BTreeMap::from([(
            BOOTSTRAP_DATA_KEY.to_string(),
            b"#cloud-config".to_vec(),
        )]));

        let plain = bootstrap_data(&secrets, "default", "bootstrap", false, &guard())
            .await
            .unwrap();
        assert_eq!(plain, STANDARD.encode("#cloud-config"));

        let compressed = bootstrap_data(&secrets, "default", "bootstrap", true, &guard())
            .await
            .unwrap();
        let mut decoded = String::new();
        GzDecoder::new(STANDARD.decode(compressed).unwrap().as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "#cloud-config");
    }

    #[tokio::test]
    async fn bootstrap_data_requires_value_key() {
        let secrets = OneSecret(BTreeMap::new());

        let err = bootstrap_data(&secrets, "default", "bootstrap", false, &guard())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BootstrapData(_)));

        let err = bootstrap_data(&secrets, "default", "missing", false, &guard())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("default/missing not found"));
    }

    #[test]
    fn addresses_skip_unknown_ips() {
        let addresses = machine_addresses(&instance(Some("10.0.0.5"), None));
        assert_eq!(
            addresses,
            vec![
                MachineAddress::new(MachineAddressType::Hostname, "worker-0"),
                MachineAddress::new(MachineAddressType::InternalIp, "10.0.0.5"),
            ]
        );

        let addresses = machine_addresses(&instance(Some(""), Some("192.168.1.100")));
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[1].address_type, MachineAddressType::ExternalIp);
    }
}

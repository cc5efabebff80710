use crate::error::{BeamoError, Result};
use crate::models::{
    ContainerSpec, EmbeddedMongoDbLocalProtocol, EnvironmentVariable, HttpMicroserviceLocalProtocol,
    LocalProtocol, Manifest, NamedVolume, PortBinding, ServiceDefinition,
};

pub const MONGO_INTERNAL_PORT: &str = "27017";

/// Health check run by the daemon inside an HTTP microservice container. A service that
/// never answers gets its main process killed.
pub fn http_health_cmd(port: &str, endpoint: &str) -> String {
    format!(
        "wget -O- -q --timeout=1 --waitretry=3 --tries=5 http://localhost:{port}/{endpoint} || kill 1"
    )
}

pub fn http_container_spec(definition: &ServiceDefinition, local: &HttpMicroserviceLocalProtocol) -> ContainerSpec {
    let hot_reload = local
        .bind_src_for_hot_reloading
        .as_ref()
        .filter(|m| !m.local_path.is_empty());

    let mut bind_mounts = Vec::new();
    bind_mounts.extend(hot_reload.cloned());
    bind_mounts.extend(local.custom_bind_mounts.iter().cloned());

    let mut env = vec![
        EnvironmentVariable::new("CID", &local.cid),
        EnvironmentVariable::new("PID", &local.pid),
        EnvironmentVariable::new("SECRET", &local.realm_secret),
        EnvironmentVariable::new("HOST", &local.web_socket_host),
        EnvironmentVariable::new("LOG_LEVEL", &local.log_level),
        EnvironmentVariable::new("NAME_PREFIX", &local.prefix),
        EnvironmentVariable::new("WATCH_TOKEN", hot_reload.is_some().to_string()),
    ];
    env.extend(local.custom_environment_variables.iter().cloned());

    ContainerSpec {
        image: definition.image_id.clone(),
        name: definition.container_name(),
        health_cmd: Some(http_health_cmd(
            &local.health_check_internal_port,
            &local.health_check_endpoint,
        )),
        auto_remove: true,
        port_bindings: local.custom_port_bindings.clone(),
        volumes: local.custom_volumes.clone(),
        bind_mounts,
        env,
    }
}

pub fn mongo_container_spec(definition: &ServiceDefinition, local: &EmbeddedMongoDbLocalProtocol) -> ContainerSpec {
    let image = if definition.image_id.is_empty() {
        local.base_image.clone()
    } else {
        definition.image_id.clone()
    };
    let beamo_id = &definition.beamo_id;

    ContainerSpec {
        image,
        name: definition.container_name(),
        health_cmd: None,
        auto_remove: false,
        port_bindings: local
            .mongo_local_port
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| PortBinding {
                local_port: p.clone(),
                in_container_port: MONGO_INTERNAL_PORT.into(),
            })
            .collect(),
        volumes: vec![
            NamedVolume {
                volume_name: EmbeddedMongoDbLocalProtocol::data_volume_name(beamo_id),
                in_container_path: local.data_volume_in_container_path.clone(),
            },
            NamedVolume {
                volume_name: EmbeddedMongoDbLocalProtocol::files_volume_name(beamo_id),
                in_container_path: local.files_volume_in_container_path.clone(),
            },
        ],
        bind_mounts: Vec::new(),
        env: vec![
            EnvironmentVariable::new("MONGO_INITDB_ROOT_USERNAME", &local.root_username),
            EnvironmentVariable::new("MONGO_INITDB_ROOT_PASSWORD", &local.root_password),
        ],
    }
}

/// The container to run for a definition, from its local protocol.
pub fn container_spec(manifest: &Manifest, definition: &ServiceDefinition) -> Result<ContainerSpec> {
    let local = manifest
        .local_protocol(&definition.beamo_id)
        .filter(|p| p.protocol_type() == definition.protocol)
        .ok_or_else(|| BeamoError::ProtocolMismatch(definition.beamo_id.clone()))?;
    Ok(match local {
        LocalProtocol::HttpMicroservice(local) => http_container_spec(definition, local),
        LocalProtocol::EmbeddedMongoDb(local) => mongo_container_spec(definition, local),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BindMount, ProtocolType};

    #[test]
    fn http_spec_env_order_and_health() {
        let mut definition = ServiceDefinition::new("svc", ProtocolType::HttpMicroservice);
        definition.image_id = "sha256:abc".into();
        let local = HttpMicroserviceLocalProtocol {
            cid: "1234".into(),
            pid: "DE_1".into(),
            custom_environment_variables: vec![EnvironmentVariable::new("EXTRA", "x")],
            ..Default::default()
        };
        let spec = http_container_spec(&definition, &local);

        assert_eq!(spec.name, "svc_httpMicroservice");
        assert_eq!(spec.image, "sha256:abc");
        assert!(spec.auto_remove);
        let names: Vec<&str> = spec.env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["CID", "PID", "SECRET", "HOST", "LOG_LEVEL", "NAME_PREFIX", "WATCH_TOKEN", "EXTRA"]
        );
        assert_eq!(spec.env[6].value, "false");
        assert_eq!(
            spec.health_cmd.as_deref(),
            Some("wget -O- -q --timeout=1 --waitretry=3 --tries=5 http://localhost:6565/health || kill 1")
        );
    }

    #[test]
    fn hot_reload_mount_comes_first() {
        let definition = ServiceDefinition::new("svc", ProtocolType::HttpMicroservice);
        let local = HttpMicroserviceLocalProtocol {
            bind_src_for_hot_reloading: Some(BindMount {
                is_read_only: false,
                local_path: "/src/svc".into(),
                in_container_path: "/subapp".into(),
            }),
            custom_bind_mounts: vec![BindMount {
                is_read_only: true,
                local_path: "/cfg".into(),
                in_container_path: "/etc/cfg".into(),
            }],
            ..Default::default()
        };
        let spec = http_container_spec(&definition, &local);
        assert_eq!(spec.bind_mounts.len(), 2);
        assert_eq!(spec.bind_mounts[0].local_path, "/src/svc");
        let watch = spec.env.iter().find(|e| e.name == "WATCH_TOKEN").unwrap();
        assert_eq!(watch.value, "true");
    }

    #[test]
    fn mongo_spec_volumes_and_port() {
        let definition = ServiceDefinition::new("inventory", ProtocolType::EmbeddedMongoDb);
        let local = EmbeddedMongoDbLocalProtocol {
            mongo_local_port: Some("27018".into()),
            ..Default::default()
        };
        let spec = mongo_container_spec(&definition, &local);

        assert_eq!(spec.name, "inventory_storage");
        assert_eq!(spec.image, "mongo:7.0");
        assert!(!spec.auto_remove);
        assert_eq!(spec.volumes[0].volume_name, "inventory_data");
        assert_eq!(spec.volumes[1].volume_name, "inventory_files");
        assert_eq!(spec.port_bindings[0].in_container_port, "27017");
        assert_eq!(spec.env[0].name, "MONGO_INITDB_ROOT_USERNAME");
    }

    #[test]
    fn spec_requires_matching_protocol() {
        let mut manifest = Manifest::default();
        let definition = ServiceDefinition::new("svc", ProtocolType::HttpMicroservice);
        manifest.local_protocols.insert(
            "svc".into(),
            LocalProtocol::EmbeddedMongoDb(EmbeddedMongoDbLocalProtocol::default()),
        );
        manifest.service_definitions.push(definition.clone());
        assert!(matches!(
            container_spec(&manifest, &definition),
            Err(BeamoError::ProtocolMismatch(_))
        ));
    }
}

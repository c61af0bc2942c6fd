//! Registry semantics: uniqueness, immutable fields, vhost lifecycle,
//! config merging, and state round-trips.

mod common;

use std::sync::Arc;

use skiff::config::{BackendConfig, Config, ServiceConfig};
use skiff::{RegistryError, ServiceRegistry};

use common::TestServer;

fn service_cfg(name: &str, port: u16) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        addr: format!("127.0.0.1:{port}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn duplicate_service_rejected() {
    let registry = ServiceRegistry::new();

    registry.add_service(service_cfg("web", 2300)).await.unwrap();
    let err = registry
        .add_service(service_cfg("web", 2301))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateService));

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn duplicate_backend_rejected() {
    let registry = ServiceRegistry::new();
    registry.add_service(service_cfg("web", 2302)).await.unwrap();

    let backend = BackendConfig {
        name: "b0".into(),
        addr: "127.0.0.1:9990".into(),
        ..Default::default()
    };
    registry.add_backend("web", backend.clone()).await.unwrap();

    let err = registry.add_backend("web", backend).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateBackend));

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn unknown_names_not_found() {
    let registry = ServiceRegistry::new();

    assert!(matches!(
        registry.update_service(service_cfg("ghost", 2303)).await,
        Err(RegistryError::NoService)
    ));
    assert!(matches!(
        registry.remove_service("ghost").await,
        Err(RegistryError::NoService)
    ));
    assert!(matches!(
        registry.service_stats("ghost").await,
        Err(RegistryError::NoService)
    ));

    registry.add_service(service_cfg("web", 2303)).await.unwrap();
    assert!(matches!(
        registry.backend_stats("web", "ghost").await,
        Err(RegistryError::NoBackend)
    ));
    assert!(matches!(
        registry.remove_backend("web", "ghost").await,
        Err(RegistryError::NoBackend)
    ));

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn immutable_fields_require_a_new_service() {
    let registry = ServiceRegistry::new();
    registry.add_service(service_cfg("update", 2304)).await.unwrap();

    // a different address would need a new listener
    let mut cfg = service_cfg("update", 2305);
    assert!(matches!(
        registry.update_service(cfg.clone()).await,
        Err(RegistryError::InvalidServiceUpdate)
    ));

    // so would a different client timeout
    cfg.addr = "127.0.0.1:2304".into();
    cfg.client_timeout = 1234;
    assert!(matches!(
        registry.update_service(cfg).await,
        Err(RegistryError::InvalidServiceUpdate)
    ));

    registry.remove_service("update").await.unwrap();
}

#[tokio::test]
async fn mutable_fields_update_in_place() {
    let registry = ServiceRegistry::new();
    registry.add_service(service_cfg("update", 2306)).await.unwrap();

    let mut cfg = service_cfg("update", 2306);
    cfg.server_timeout = 1234;
    cfg.https_redirect = true;
    cfg.fall = 5;
    cfg.rise = 6;
    cfg.balance = "LC".into();
    registry.update_service(cfg).await.unwrap();

    let updated = registry.service_config("update").await.unwrap();
    assert_eq!(updated.server_timeout, 1234);
    assert!(updated.https_redirect);
    assert_eq!(updated.fall, 5);
    assert_eq!(updated.rise, 6);
    assert_eq!(updated.balance, "LC");

    registry.remove_service("update").await.unwrap();
}

#[tokio::test]
async fn vhosts_garbage_collected_with_last_service() {
    let registry = ServiceRegistry::new();

    let mut web1 = service_cfg("web1", 2307);
    web1.virtual_hosts = vec!["www.example.com".into()];
    let mut web2 = service_cfg("web2", 2308);
    web2.virtual_hosts = vec!["www.example.com".into()];

    registry.add_service(web1).await.unwrap();
    registry.add_service(web2).await.unwrap();
    assert_eq!(registry.vhosts_len().await, 1);

    // one service left: the vhost stays and routes to it
    registry.remove_service("web1").await.unwrap();
    let svc = registry.get_vhost_service("www.example.com").await.unwrap();
    assert_eq!(svc.name, "web2");

    // removing the last referencing service deletes the vhost
    registry.remove_service("web2").await.unwrap();
    assert_eq!(registry.vhosts_len().await, 0);
    assert!(registry.get_vhost_service("www.example.com").await.is_none());

    // and a new service with that vhost recreates it
    let mut web3 = service_cfg("web3", 2309);
    web3.virtual_hosts = vec!["www.example.com".into()];
    registry.add_service(web3).await.unwrap();
    let svc = registry.get_vhost_service("www.example.com").await.unwrap();
    assert_eq!(svc.name, "web3");

    registry.remove_service("web3").await.unwrap();
}

#[tokio::test]
async fn update_rewrites_vhost_membership() {
    let registry = ServiceRegistry::new();

    let mut cfg = service_cfg("web", 2310);
    cfg.virtual_hosts = vec!["a.example.com".into()];
    registry.add_service(cfg.clone()).await.unwrap();

    cfg.virtual_hosts = vec!["b.example.com".into()];
    registry.update_service(cfg).await.unwrap();

    assert!(registry.get_vhost_service("a.example.com").await.is_none());
    let svc = registry.get_vhost_service("b.example.com").await.unwrap();
    assert_eq!(svc.name, "web");
    assert_eq!(registry.vhosts_len().await, 1);

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn global_defaults_flow_into_new_services() {
    let registry = ServiceRegistry::new();

    let defaults = Config {
        balance: "LC".into(),
        check_interval: 900,
        fall: 7,
        rise: 8,
        server_timeout: 4321,
        services: vec![service_cfg("web", 2311)],
        ..Default::default()
    };
    registry.update_config(defaults).await.unwrap();

    let cfg = registry.service_config("web").await.unwrap();
    assert_eq!(cfg.balance, "LC");
    assert_eq!(cfg.check_interval, 900);
    assert_eq!(cfg.fall, 7);
    assert_eq!(cfg.rise, 8);
    assert_eq!(cfg.server_timeout, 4321);
    // unset fields fall back to the crate defaults
    assert_eq!(cfg.client_timeout, 2000);

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn port_conflict_with_admin_listener() {
    let registry = ServiceRegistry::new().with_admin_addr("127.0.0.1:2312");

    let cfg = Config {
        services: vec![service_cfg("web", 2312)],
        ..Default::default()
    };

    let err = registry.update_config(cfg).await.unwrap_err();
    assert!(err.to_string().contains("port conflict"));
    assert!(registry.get_service("web").await.is_none());
}

#[tokio::test]
async fn one_bad_service_does_not_abort_the_rest() {
    let registry = ServiceRegistry::new();

    // second service collides with the first one's port and fails to bind
    let cfg = Config {
        services: vec![service_cfg("good", 2313), service_cfg("bad", 2313)],
        ..Default::default()
    };

    let err = registry.update_config(cfg).await.unwrap_err();
    let RegistryError::Multi(multi) = err else {
        panic!("expected an aggregated error");
    };
    assert_eq!(multi.len(), 1);

    assert!(registry.get_service("good").await.is_some());
    assert!(registry.get_service("bad").await.is_none());

    registry.remove_service("good").await.unwrap();
}

#[tokio::test]
async fn config_round_trips_and_reapply_is_a_noop() {
    let server = TestServer::start().await;
    let registry = ServiceRegistry::new();

    let mut cfg = service_cfg("web", 2314);
    cfg.virtual_hosts = vec!["www.example.com".into()];
    cfg.backends.push(BackendConfig {
        name: "b0".into(),
        addr: server.addr.clone(),
        ..Default::default()
    });

    registry
        .update_config(Config {
            services: vec![cfg],
            ..Default::default()
        })
        .await
        .unwrap();

    let out = registry.config().await;
    let bytes = out.marshal();

    // the authoritative config re-serializes identically
    assert_eq!(bytes, registry.config().await.marshal());

    let service_before = registry.get_service("web").await.unwrap();
    let backend_before = service_before.get_backend("b0").unwrap();

    // resubmitting the same bytes reconstructs nothing
    let reparsed: Config = serde_json::from_slice(&bytes).unwrap();
    registry.update_config(reparsed).await.unwrap();

    let service_after = registry.get_service("web").await.unwrap();
    let backend_after = service_after.get_backend("b0").unwrap();
    assert!(Arc::ptr_eq(&service_before, &service_after));
    assert!(Arc::ptr_eq(&backend_before, &backend_after));
    assert_eq!(bytes, registry.config().await.marshal());

    registry.remove_service("web").await.unwrap();
}

#[tokio::test]
async fn bind_failure_reported_from_add_service() {
    let registry = ServiceRegistry::new();

    // occupy the port first
    registry.add_service(service_cfg("first", 2315)).await.unwrap();

    let err = registry
        .add_service(service_cfg("second", 2315))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Bind(_)));

    registry.remove_service("first").await.unwrap();
}

#[tokio::test]
async fn unknown_network_rejected() {
    let registry = ServiceRegistry::new();

    let mut cfg = service_cfg("web", 2316);
    cfg.network = "sctp".into();

    let err = registry.add_service(cfg).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownNetwork(_)));
}

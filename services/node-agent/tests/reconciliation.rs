//! End-to-end reconcile pass against a mocked control plane: fetch network
//! info, generate (fake) wireguard keys, fetch a config bundle, apply it to
//! a scratch root, and report the applied fingerprint back.

use std::path::PathBuf;

use gluon_node_agent::config::{Config, EnrollmentState, NodeRole};
use gluon_node_agent::reconciler::Reconciler;
use gluon_node_agent::ControlPlaneClient;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(control_plane_url: String, data_dir: PathBuf) -> Config {
    Config {
        control_plane_url,
        data_dir,
        hostname: "node-a".into(),
        provider: "test".into(),
        os: "linux".into(),
        desired_role: NodeRole::Worker,
        heartbeat_interval_secs: 10,
        log_level: "info".into(),
        enrollment: EnrollmentState {
            request_id: Some(1),
            enrollment_secret: Some("es_test".into()),
            node_id: Some(7),
            api_key: Some("key_test".into()),
        },
    }
}

#[tokio::test]
async fn reconcile_once_is_a_no_op_without_required_interfaces() {
    let server = MockServer::start().await;
    let data_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/agent/network/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "node_id": 7,
            "role": "worker",
            "hub_number": null,
            "required_interfaces": []
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/agent/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": 1,
            "hash": "deadbeef",
            "wireguard_configs": {},
            "network_interface_file": "",
            "frr_config_file": "",
            "ssh_authorized_keys": []
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/agent/config/applied"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"recorded": true})))
        .mount(&server)
        .await;

    let config = test_config(server.uri(), data_dir.path().to_path_buf());
    let client = ControlPlaneClient::new(&config);
    let reconciler = Reconciler::new(config.data_dir.clone());

    reconciler.reconcile_once(&client).await.unwrap();

    let state_path = data_dir.path().join("config-state.json");
    assert!(state_path.exists());
}

#[tokio::test]
async fn reconcile_once_skips_reapplying_an_already_applied_bundle() {
    let server = MockServer::start().await;
    let data_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/agent/network/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "node_id": 7,
            "role": "worker",
            "hub_number": null,
            "required_interfaces": []
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/agent/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": 3,
            "hash": "samehash",
            "wireguard_configs": {},
            "network_interface_file": "",
            "frr_config_file": "",
            "ssh_authorized_keys": []
        })))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/agent/config/applied"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"recorded": true})))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(server.uri(), data_dir.path().to_path_buf());
    let client = ControlPlaneClient::new(&config);
    let reconciler = Reconciler::new(config.data_dir.clone());

    reconciler.reconcile_once(&client).await.unwrap();
    reconciler.reconcile_once(&client).await.unwrap();
}

#[tokio::test]
async fn reconcile_once_writes_wireguard_frr_and_interfaces_files() {
    let server = MockServer::start().await;
    let data_dir = tempfile::tempdir().unwrap();
    let scratch_root = tempfile::tempdir().unwrap();

    // Pre-seed a keypair so `ensure_keys` short-circuits instead of shelling
    // out to the real `wg` binary.
    let keys_dir = scratch_root.path().join("etc/wireguard/keys");
    std::fs::create_dir_all(&keys_dir).unwrap();
    std::fs::write(keys_dir.join("wg-hub1.key"), "test-private-key\n").unwrap();
    std::fs::write(keys_dir.join("wg-hub1.pub"), "test-public-key\n").unwrap();

    Mock::given(method("GET"))
        .and(path("/api/agent/network/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "node_id": 7,
            "role": "worker",
            "hub_number": null,
            "required_interfaces": ["wg-hub1"]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/agent/network/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 1})))
        .mount(&server)
        .await;

    let wireguard_conf = "[Interface]\nPrivateKey = PRIVATE_KEY_PLACEHOLDER\nListenPort = 52001\n";
    let interfaces_conf = "auto dummy0\niface dummy0 inet static\n    address 10.255.0.5/32\n";
    let frr_conf = "frr version 9\nhostname worker-1\n";

    Mock::given(method("GET"))
        .and(path("/api/agent/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": 4,
            "hash": "realbundle",
            "wireguard_configs": {"wg-hub1": wireguard_conf},
            "network_interface_file": interfaces_conf,
            "frr_config_file": frr_conf,
            "ssh_authorized_keys": []
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/agent/config/applied"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"recorded": true})))
        .mount(&server)
        .await;

    let config = test_config(server.uri(), data_dir.path().to_path_buf());
    let client = ControlPlaneClient::new(&config);
    let reconciler = Reconciler::rooted_at(config.data_dir.clone(), scratch_root.path().to_path_buf());

    reconciler.reconcile_once(&client).await.unwrap();

    let written_wireguard =
        std::fs::read_to_string(scratch_root.path().join("etc/wireguard/wg-hub1.conf")).unwrap();
    assert!(written_wireguard.contains("PrivateKey = test-private-key"));
    assert!(!written_wireguard.contains("PRIVATE_KEY_PLACEHOLDER"));

    let written_interfaces =
        std::fs::read_to_string(scratch_root.path().join("etc/network/interfaces.d/gluon")).unwrap();
    assert_eq!(written_interfaces, interfaces_conf);

    let written_frr = std::fs::read_to_string(scratch_root.path().join("etc/frr/frr.conf")).unwrap();
    assert_eq!(written_frr, frr_conf);

    let state_path = data_dir.path().join("config-state.json");
    assert!(state_path.exists());
}

use domain::{ConnectionDescriptor, DeviceCacheEntry, HealthState};

#[test]
fn health_state_orders_worst_first() {
    assert!(HealthState::Critical < HealthState::Warning);
    assert!(HealthState::Warning < HealthState::Good);
    assert_eq!(
        [HealthState::Good, HealthState::Critical, HealthState::Warning]
            .into_iter()
            .min(),
        Some(HealthState::Critical)
    );
    assert_eq!(HealthState::Good.code(), 2);
}

#[test]
fn connection_string_parses_and_formats() {
    let descriptor = ConnectionDescriptor::parse(
        "HostName=hub.example.net;DeviceId=asset-1;SharedAccessKey=abc=",
    )
    .expect("descriptor");
    assert_eq!(descriptor.host_name, "hub.example.net");
    assert_eq!(descriptor.device_id, "asset-1");
    assert_eq!(descriptor.shared_access_key.as_deref(), Some("abc="));
    assert_eq!(descriptor.client_id(), "asset-1");
    assert_eq!(
        descriptor.to_string(),
        "HostName=hub.example.net;DeviceId=asset-1;SharedAccessKey=abc="
    );
}

#[test]
fn connection_string_requires_host_and_device() {
    assert!(ConnectionDescriptor::parse("DeviceId=asset-1").is_none());
    assert!(ConnectionDescriptor::parse("HostName=hub;DeviceId=").is_none());
}

#[test]
fn module_descriptor_client_id() {
    let descriptor = ConnectionDescriptor::for_module("hub", "edge-1", "gateway");
    assert_eq!(descriptor.client_id(), "edge-1/gateway");
}

#[test]
fn cache_entry_uses_camel_case() {
    let entry: DeviceCacheEntry = serde_json::from_value(serde_json::json!({
        "deviceProvisionInfo": {
            "deviceId": "asset-1",
            "modelId": "urn:model:1",
            "deviceKey": "key",
            "opcPublisherNodesRequest": {
                "EndpointUrl": "opc.tcp://plc:4840",
                "OpcNodes": [{ "Id": "ns=2;s=Indicator" }]
            }
        },
        "connectionDescriptor": {
            "hostName": "hub",
            "deviceId": "asset-1"
        }
    }))
    .expect("entry");
    assert_eq!(entry.device_id(), "asset-1");
    assert!(!entry.device_provision_info.opc_publisher_nodes_request.use_security);
}

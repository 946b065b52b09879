//! End-to-end dispatch scenarios against the mock backend: envelope
//! round trips, schema enforcement, notification emission rules and
//! unknown-target handling.

mod common;

use foris_core::message::{Message, MessageKind};
use foris_core::INCORRECT_INPUT_PREFIX;
use foris_daemon::hub::SubscriptionFilter;
use serde_json::json;

#[tokio::test]
async fn every_registered_action_round_trips_module_action_and_kind() {
    let daemon = common::mock_daemon();
    // Read actions are safe to fire blind with no data.
    for (module, action) in [
        ("about", "get"),
        ("dns", "get_settings"),
        ("remote", "get_status"),
        ("subordinates", "list"),
        ("web", "get_data"),
        ("web", "list_languages"),
    ] {
        let reply = daemon
            .registry
            .dispatch(Message::request(module, action, None))
            .await;
        assert_eq!(reply.module, module);
        assert_eq!(reply.action, action);
        assert_eq!(reply.kind, MessageKind::Reply);
        assert!(
            reply.errors.is_empty(),
            "{module}/{action} failed: {:?}",
            reply.errors
        );
    }
}

#[tokio::test]
async fn set_language_round_trip_with_notification() {
    let daemon = common::mock_daemon();
    let sub = daemon.context.hub.subscribe(SubscriptionFilter::All);

    let reply = daemon
        .registry
        .dispatch(Message::request(
            "web",
            "set_language",
            Some(json!({"language": "cs"})),
        ))
        .await;
    assert_eq!(reply.data, Some(json!({"result": true})));

    let follow_up = daemon
        .registry
        .dispatch(Message::request("web", "get_data", None))
        .await;
    assert_eq!(follow_up.data, Some(json!({"language": "cs"})));

    let notification = sub.try_recv().expect("set_language notification missing");
    assert_eq!(notification.kind, MessageKind::Notification);
    assert_eq!(notification.module, "web");
    assert_eq!(notification.action, "set_language");
    assert_eq!(notification.data, Some(json!({"language": "cs"})));
    assert!(sub.try_recv().is_none(), "exactly one notification expected");
}

#[tokio::test]
async fn set_language_refuses_uninstalled_language_without_notification() {
    let daemon = common::mock_daemon();
    let sub = daemon.context.hub.subscribe(SubscriptionFilter::All);
    let reply = daemon
        .registry
        .dispatch(Message::request(
            "web",
            "set_language",
            Some(json!({"language": "xx"})),
        ))
        .await;
    assert_eq!(reply.data, Some(json!({"result": false})));
    assert!(reply.errors.is_empty());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn dns_update_settings_notifies_with_identical_data() {
    let daemon = common::mock_daemon();
    let sub = daemon.context.hub.subscribe(SubscriptionFilter::selected([(
        "dns",
        "update_settings",
    )]));
    let data = json!({
        "forwarding_enabled": false,
        "dnssec_enabled": false,
        "dns_from_dhcp_enabled": false,
    });
    let reply = daemon
        .registry
        .dispatch(Message::request(
            "dns",
            "update_settings",
            Some(data.clone()),
        ))
        .await;
    assert_eq!(reply.data, Some(json!({"result": true})));

    let notification = sub.try_recv().expect("update_settings notification missing");
    assert_eq!(notification.data, Some(data.clone()));

    let settings = daemon
        .registry
        .dispatch(Message::request("dns", "get_settings", None))
        .await;
    assert_eq!(settings.data, Some(data));
}

#[tokio::test]
async fn schema_violation_reports_incorrect_input_and_mutates_nothing() {
    let daemon = common::mock_daemon();
    let sub = daemon.context.hub.subscribe(SubscriptionFilter::All);

    let reply = daemon
        .registry
        .dispatch(Message::request(
            "about",
            "get",
            Some(json!({"extra": "data"})),
        ))
        .await;
    assert!(reply.is_error_reply());
    assert!(reply.errors[0].description.starts_with(INCORRECT_INPUT_PREFIX));
    assert!(sub.try_recv().is_none());

    for bad_data in [
        // Missing required field.
        json!({"forwarding_enabled": false}),
        // Unknown field.
        json!({
            "forwarding_enabled": false,
            "dnssec_enabled": false,
            "dns_from_dhcp_enabled": false,
            "surprise": 1,
        }),
        // Wrong type.
        json!({
            "forwarding_enabled": "no",
            "dnssec_enabled": false,
            "dns_from_dhcp_enabled": false,
        }),
    ] {
        let reply = daemon
            .registry
            .dispatch(Message::request("dns", "update_settings", Some(bad_data)))
            .await;
        assert!(reply.is_error_reply());
        assert!(reply.errors[0].description.starts_with(INCORRECT_INPUT_PREFIX));
    }
    assert!(sub.try_recv().is_none(), "schema violations must not notify");

    // And the store is untouched: defaults still read back.
    let settings = daemon
        .registry
        .dispatch(Message::request("dns", "get_settings", None))
        .await;
    assert_eq!(
        settings.data.unwrap()["forwarding_enabled"],
        json!(true),
        "failed request must not mutate settings"
    );
}

#[tokio::test]
async fn unknown_module_and_action_report_incorrect_input() {
    let daemon = common::mock_daemon();
    let reply = daemon
        .registry
        .dispatch(Message::request("nonsense", "get", None))
        .await;
    assert_eq!(
        reply.errors[0].description,
        "Incorrect input. Unknown module"
    );
    let reply = daemon
        .registry
        .dispatch(Message::request("dns", "nonsense", None))
        .await;
    assert_eq!(
        reply.errors[0].description,
        "Incorrect input. Unknown action"
    );
}

#[tokio::test]
async fn about_get_reports_device_identity() {
    let daemon = common::mock_daemon();
    let reply = daemon
        .registry
        .dispatch(Message::request("about", "get", None))
        .await;
    let data = reply.data.unwrap();
    assert_eq!(data["serial"], foris_daemon::state::MOCK_CONTROLLER_ID);
    assert!(data["temperature"]["CPU"].is_i64());
}

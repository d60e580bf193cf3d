// Retained-state bootstrap and command dispatch over the in-process bus

use serde_json::Value;
use std::sync::{Arc, Mutex};
use thermo_rs::bus::{DeviceInfo, LocalBus, MessageBus};
use thermo_rs::entity::{
    ClimateEntity, ClimateOptions, CommandHandler, EntityRegistry, Mode, ParamValue, Parameter, ParameterOptions,
};
use tokio::time::Duration;

const KP_STATE: &str = "number/dev/kp/state";
const KP_SET: &str = "number/dev/kp/set";
const FALLBACK: Duration = Duration::from_secs(10);

fn device() -> DeviceInfo {
    DeviceInfo::new("dev", "Device")
}

fn recording_handler() -> (CommandHandler, Arc<Mutex<Vec<ParamValue>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: CommandHandler = Arc::new(move |value: &ParamValue| {
        sink.lock().unwrap().push(value.clone());
        Ok(())
    });
    (handler, seen)
}

fn kp(handler: CommandHandler) -> Arc<Parameter> {
    let options = ParameterOptions::default().value(1.5).bounds(0.0, 64000.0, 0.1);
    Arc::new(Parameter::number(&device(), "kp", "Proportional", options, handler).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_retained_value_is_adopted_without_fallback() {
    let (local, mut dispatcher) = LocalBus::new();
    local.publish(KP_STATE, "2.5", true).unwrap();

    let (handler, seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let param = registry.register(kp(handler));
    registry.connect(Arc::new(local.clone())).unwrap();
    dispatcher.drain();

    assert_eq!(param.get(), Some(ParamValue::Number(2.5)));
    assert_eq!(*seen.lock().unwrap(), vec![ParamValue::Number(2.5)]);
    assert!(!local.is_subscribed(KP_STATE));

    tokio::time::sleep(FALLBACK + Duration::from_secs(1)).await;
    assert_eq!(local.published_to(KP_STATE), vec!["2.5"]);
}

#[tokio::test(start_paused = true)]
async fn test_default_published_exactly_once_without_retained() {
    let (local, mut dispatcher) = LocalBus::new();
    let (handler, seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let param = registry.register(kp(handler));
    registry.connect(Arc::new(local.clone())).unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(local.published_to(KP_STATE).is_empty());

    tokio::time::sleep(Duration::from_secs(20)).await;
    dispatcher.drain();
    assert_eq!(local.published_to(KP_STATE), vec!["1.5"]);
    assert_eq!(local.retained(KP_STATE).as_deref(), Some("1.5"));
    assert_eq!(param.get_f64(), 1.5);
    // The default is not fed back through the handler.
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_suppressed_when_unchanged() {
    let (local, mut dispatcher) = LocalBus::new();
    let (handler, seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let param = registry.register(kp(handler));
    registry.connect(Arc::new(local.clone())).unwrap();
    tokio::time::sleep(FALLBACK + Duration::from_secs(1)).await;

    local.publish(KP_SET, "3", false).unwrap();
    dispatcher.drain();
    assert_eq!(param.get(), Some(ParamValue::Integer(3)));
    assert_eq!(local.published_to(KP_STATE), vec!["1.5", "3"]);

    local.publish(KP_SET, "3", false).unwrap();
    dispatcher.drain();
    assert_eq!(local.published_to(KP_STATE), vec!["1.5", "3"]);
    assert_eq!(seen.lock().unwrap().len(), 2);

    // Out of range and non-numeric commands change nothing.
    local.publish(KP_SET, "-4", false).unwrap();
    local.publish(KP_SET, "lots", false).unwrap();
    dispatcher.drain();
    assert_eq!(param.get(), Some(ParamValue::Integer(3)));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_finite_and_same_numeric_commands_change_nothing() {
    let (local, mut dispatcher) = LocalBus::new();
    let (handler, seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let param = registry.register(kp(handler));
    registry.connect(Arc::new(local.clone())).unwrap();
    tokio::time::sleep(FALLBACK + Duration::from_secs(1)).await;

    for raw in ["nan", "NaN", "inf"] {
        local.publish(KP_SET, raw, false).unwrap();
    }
    dispatcher.drain();
    assert_eq!(param.get(), Some(ParamValue::Number(1.5)));
    assert!(seen.lock().unwrap().is_empty());

    local.publish(KP_SET, "3", false).unwrap();
    local.publish(KP_SET, "3.0", false).unwrap();
    dispatcher.drain();
    assert_eq!(local.published_to(KP_STATE), vec!["1.5", "3"]);
}

#[tokio::test(start_paused = true)]
async fn test_climate_rejects_nan_setpoint() {
    let (local, mut dispatcher) = LocalBus::new();
    let setpoints = Arc::new(Mutex::new(Vec::new()));
    let sink = setpoints.clone();
    let options = ClimateOptions { target_temperature: 19.0, ..ClimateOptions::default() };
    let climate = Arc::new(
        ClimateEntity::new(
            &device(),
            "climate",
            "Climate",
            options,
            Arc::new(move |t: f64| {
                sink.lock().unwrap().push(t);
                Ok(())
            }),
            Arc::new(|_mode: Mode| Ok(())),
        )
        .unwrap(),
    );
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let climate = registry.register(climate);
    registry.connect(Arc::new(local.clone())).unwrap();
    tokio::time::sleep(FALLBACK + Duration::from_secs(1)).await;

    local.publish("climate/dev/climate/target_temperature/set", "nan", false).unwrap();
    dispatcher.drain();
    assert_eq!(climate.target_temperature(), 19.0);
    assert!(setpoints.lock().unwrap().is_empty());
    assert_eq!(local.published_to("climate/dev/climate/target_temperature/state"), vec!["19.0"]);
}

#[tokio::test(start_paused = true)]
async fn test_climate_fields_bootstrap_independently() {
    let (local, mut dispatcher) = LocalBus::new();
    local.publish("climate/dev/climate/mode/state", "heat", true).unwrap();

    let modes = Arc::new(Mutex::new(Vec::new()));
    let sink = modes.clone();
    let options = ClimateOptions { target_temperature: 19.0, ..ClimateOptions::default() };
    let climate = Arc::new(
        ClimateEntity::new(
            &device(),
            "climate",
            "Climate",
            options,
            Arc::new(|_t: f64| Ok(())),
            Arc::new(move |mode: Mode| {
                sink.lock().unwrap().push(mode);
                Ok(())
            }),
        )
        .unwrap(),
    );
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let climate = registry.register(climate);
    registry.connect(Arc::new(local.clone())).unwrap();
    dispatcher.drain();

    assert_eq!(climate.mode(), Mode::Heat);
    assert_eq!(*modes.lock().unwrap(), vec![Mode::Heat]);

    tokio::time::sleep(FALLBACK + Duration::from_secs(1)).await;
    assert_eq!(local.published_to("climate/dev/climate/target_temperature/state"), vec!["19.0"]);
    assert_eq!(local.published_to("climate/dev/climate/mode/state"), vec!["heat"]);

    local.publish("climate/dev/climate/mode/set", "cool", false).unwrap();
    dispatcher.drain();
    assert_eq!(climate.mode(), Mode::Heat);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_published_for_every_entity() {
    let (local, _dispatcher) = LocalBus::new();
    let (handler, _seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    registry.register(kp(handler));
    registry.register(Arc::new(
        Parameter::sensor(&device(), "actualtemp", "Actual Temp.", ParameterOptions::default().unit("°C")).unwrap(),
    ));
    registry.connect(Arc::new(local.clone())).unwrap();

    let config: Value = serde_json::from_str(&local.retained("homeassistant/number/dev_kp/config").unwrap()).unwrap();
    assert_eq!(config["state_topic"], KP_STATE);
    assert_eq!(config["command_topic"], KP_SET);
    assert_eq!(config["min"], 0.0);
    assert_eq!(config["device"]["model"], "dev v1");

    let config: Value =
        serde_json::from_str(&local.retained("homeassistant/sensor/dev_actualtemp/config").unwrap()).unwrap();
    assert_eq!(config["unit_of_measurement"], "°C");
    assert!(config.get("command_topic").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_writes_are_skipped() {
    let (local, _dispatcher) = LocalBus::new();
    let (handler, _seen) = recording_handler();
    let mut registry = EntityRegistry::new(device(), FALLBACK);
    let param = registry.register(kp(handler));
    registry.connect(Arc::new(local.clone())).unwrap();
    registry.disconnect();

    assert!(param.set(7.0));
    assert_eq!(param.get_f64(), 7.0);
    tokio::time::sleep(FALLBACK * 2).await;
    assert!(local.published_to(KP_STATE).is_empty());
}

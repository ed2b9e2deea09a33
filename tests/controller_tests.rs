use std::io::Write;
use std::sync::Arc;

use gpioctl::{
    ControllerConfig, GpioController, GpioError, PinLayout, PinMode, PinNumberingScheme,
    PinValue, PinValuePair, SimulatedBackend,
};

fn sample_config() -> ControllerConfig {
    serde_json::from_str(
        r#"
        {
            "pin_count": 28,
            "pins": {
                "4": {
                    "name": "BUTTON 1",
                    "line": 4,
                    "modes": ["input"]
                },
                "17": {
                    "name": "LED 1",
                    "line": 17,
                    "modes": ["output"]
                },
                "27": {
                    "name": "General IO 1",
                    "line": 27,
                    "modes": ["input", "output"]
                }
            },
            "board_layout": {
                "7": 4,
                "11": 17,
                "13": 27
            },
            "event_history_capacity": 8
        }
        "#,
    )
    .expect("valid sample config")
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn simulated() -> (Arc<SimulatedBackend>, GpioController) {
    init_logging();
    let backend = Arc::new(SimulatedBackend::new(28));
    let controller = GpioController::new(backend.clone());
    (backend, controller)
}

#[test]
fn unopened_pins_reject_io() {
    let (_, controller) = simulated();

    for pin in 0..28 {
        assert_eq!(controller.read(pin), Err(GpioError::NotOpen(pin)));
        assert_eq!(
            controller.write(pin, PinValue::High),
            Err(GpioError::NotOpen(pin))
        );
        assert_eq!(controller.get_pin_mode(pin), Err(GpioError::NotOpen(pin)));
        assert_eq!(controller.is_pin_open(pin), Ok(false));
    }
}

#[test]
fn open_twice_fails() {
    let (_, controller) = simulated();

    controller.open_pin(5).unwrap();
    assert_eq!(controller.open_pin(5), Err(GpioError::AlreadyOpen(5)));
    assert_eq!(
        controller.open_pin_with_mode(5, PinMode::Output),
        Err(GpioError::AlreadyOpen(5))
    );
    assert_eq!(controller.get_pin_mode(5), Ok(PinMode::Input));
}

#[test]
fn close_of_unopened_pin_fails() {
    let (_, controller) = simulated();

    assert_eq!(controller.close_pin(6), Err(GpioError::NotOpen(6)));
    controller.open_pin(6).unwrap();
    controller.close_pin(6).unwrap();
    assert_eq!(controller.close_pin(6), Err(GpioError::NotOpen(6)));
}

#[test]
fn out_of_range_pin_is_invalid() {
    let (_, controller) = simulated();

    assert_eq!(
        controller.open_pin(28),
        Err(GpioError::InvalidPin(28, PinNumberingScheme::Logical))
    );
    assert_eq!(
        controller.is_pin_mode_supported(99, PinMode::Input),
        Err(GpioError::InvalidPin(99, PinNumberingScheme::Logical))
    );
    assert_eq!(controller.pin_count(), Ok(28));
}

#[test]
fn set_mode_round_trips_for_supported_modes() {
    let (_, controller) = simulated();
    controller.open_pin(12).unwrap();

    for mode in [PinMode::Output, PinMode::Input, PinMode::Output] {
        assert_eq!(controller.is_pin_mode_supported(12, mode), Ok(true));
        controller.set_pin_mode(12, mode).unwrap();
        assert_eq!(controller.get_pin_mode(12), Ok(mode));
    }
    assert_eq!(
        controller.set_pin_mode(13, PinMode::Input),
        Err(GpioError::NotOpen(13))
    );
}

#[test]
fn output_write_reads_back() {
    let (backend, controller) = simulated();
    controller.open_pin_with_mode(3, PinMode::Output).unwrap();

    for value in [PinValue::High, PinValue::Low, PinValue::High] {
        controller.write(3, value).unwrap();
        assert_eq!(controller.read(3), Ok(value));
        assert_eq!(backend.level(3), Some(value));
    }
}

#[test]
fn blink_pin_17_end_to_end() {
    let (backend, controller) = simulated();

    controller.open_pin_with_mode(17, PinMode::Output).unwrap();
    controller.write(17, PinValue::High).unwrap();
    assert_eq!(controller.read(17), Ok(PinValue::High));
    controller.write(17, PinValue::Low).unwrap();
    assert_eq!(controller.read(17), Ok(PinValue::Low));
    controller.close_pin(17).unwrap();

    assert_eq!(controller.is_pin_open(17), Ok(false));
    assert_eq!(backend.mode(17), None);
}

#[test]
fn writing_an_input_is_rejected() {
    let (backend, controller) = simulated();
    controller.open_pin(4).unwrap();

    assert!(matches!(
        controller.write(4, PinValue::High),
        Err(GpioError::InvalidOperation(_))
    ));

    backend.drive(4, PinValue::High).unwrap();
    assert_eq!(controller.read(4), Ok(PinValue::High));
}

#[test]
fn dispose_is_idempotent_and_final() {
    let (backend, controller) = simulated();
    controller.open_pin_with_mode(17, PinMode::Output).unwrap();
    controller.open_pin(4).unwrap();
    assert_eq!(backend.subscription_count(), 1);

    controller.dispose().unwrap();
    controller.dispose().unwrap();

    assert_eq!(backend.mode(17), None);
    assert_eq!(backend.subscription_count(), 0);
    assert_eq!(controller.read(17), Err(GpioError::Disposed));
    assert_eq!(
        controller.write(17, PinValue::High),
        Err(GpioError::Disposed)
    );
    assert_eq!(controller.open_pin(5), Err(GpioError::Disposed));
    assert_eq!(controller.close_pin(17), Err(GpioError::Disposed));
    assert_eq!(controller.is_pin_open(17), Err(GpioError::Disposed));
    assert_eq!(controller.pin_count(), Err(GpioError::Disposed));
    assert_eq!(controller.numbering_scheme(), Err(GpioError::Disposed));
}

#[test]
fn board_numbering_maps_header_positions() {
    init_logging();
    let backend = Arc::new(SimulatedBackend::new(28));
    let controller =
        GpioController::with_numbering_scheme(PinNumberingScheme::Board, backend.clone());

    assert_eq!(controller.numbering_scheme(), Ok(PinNumberingScheme::Board));
    assert_eq!(controller.pin_count(), Ok(28));

    controller.open_pin_with_mode(11, PinMode::Output).unwrap();
    controller.write(11, PinValue::High).unwrap();
    assert_eq!(backend.level(17), Some(PinValue::High));
    assert_eq!(controller.open_pins(), Ok(vec![11]));

    // header position 1 is 3.3V power
    assert_eq!(
        controller.open_pin(1),
        Err(GpioError::InvalidPin(1, PinNumberingScheme::Board))
    );
}

#[test]
fn shared_line_opens_under_one_board_number_only() {
    init_logging();
    let backend = Arc::new(SimulatedBackend::new(28).with_layout(PinLayout::new([(3, 2), (5, 2)])));
    let controller =
        GpioController::with_numbering_scheme(PinNumberingScheme::Board, backend.clone());

    controller.open_pin_with_mode(3, PinMode::Output).unwrap();
    assert_eq!(controller.open_pin(5), Err(GpioError::AlreadyOpen(5)));
    assert_eq!(controller.is_pin_open(5), Ok(false));
    assert_eq!(backend.mode(2), Some(PinMode::Output));

    controller.write(3, PinValue::High).unwrap();
    assert_eq!(backend.level(2), Some(PinValue::High));

    controller.close_pin(3).unwrap();
    controller.open_pin(5).unwrap();
    assert_eq!(backend.mode(2), Some(PinMode::Input));
    assert_eq!(controller.open_pins(), Ok(vec![5]));
}

#[test]
fn pin_profiles_limit_modes() {
    init_logging();
    let config = sample_config();
    let backend = Arc::new(SimulatedBackend::from_config(&config));
    let controller = GpioController::with_config(&config, backend);

    assert_eq!(controller.is_pin_mode_supported(4, PinMode::Input), Ok(true));
    assert_eq!(
        controller.is_pin_mode_supported(4, PinMode::Output),
        Ok(false)
    );
    assert_eq!(
        controller.open_pin_with_mode(4, PinMode::Output),
        Err(GpioError::UnsupportedMode {
            pin: 4,
            mode: PinMode::Output
        })
    );
    assert_eq!(
        controller.open_pin(5),
        Err(GpioError::InvalidPin(5, PinNumberingScheme::Logical))
    );

    controller.open_pin(4).unwrap();
    assert_eq!(
        controller.set_pin_mode(4, PinMode::Output),
        Err(GpioError::UnsupportedMode {
            pin: 4,
            mode: PinMode::Output
        })
    );
    assert_eq!(controller.get_pin_mode(4), Ok(PinMode::Input));
}

#[test]
fn batch_reads_and_writes() {
    let (backend, controller) = simulated();
    controller.open_pin_with_mode(20, PinMode::Output).unwrap();
    controller.open_pin_with_mode(21, PinMode::Output).unwrap();
    controller.open_pin(22).unwrap();
    backend.drive(22, PinValue::High).unwrap();

    controller
        .write_many(&[
            PinValuePair::new(20, PinValue::High),
            PinValuePair::new(21, PinValue::Low),
        ])
        .unwrap();

    let mut pairs = [
        PinValuePair::new(20, PinValue::Low),
        PinValuePair::new(21, PinValue::High),
        PinValuePair::new(22, PinValue::Low),
    ];
    controller.read_many(&mut pairs).unwrap();
    assert_eq!(
        pairs.map(|p| p.value),
        [PinValue::High, PinValue::Low, PinValue::High]
    );

    assert_eq!(
        controller.write_many(&[
            PinValuePair::new(20, PinValue::Low),
            PinValuePair::new(23, PinValue::High),
        ]),
        Err(GpioError::NotOpen(23))
    );
    assert_eq!(controller.read(20), Ok(PinValue::Low));
}

#[test]
fn distinct_pins_toggle_concurrently() {
    let (backend, controller) = simulated();
    let pins = [5, 6, 13, 19];
    for pin in pins {
        controller.open_pin_with_mode(pin, PinMode::Output).unwrap();
    }

    std::thread::scope(|scope| {
        for pin in pins {
            let controller = &controller;
            scope.spawn(move || {
                let mut value = PinValue::Low;
                for _ in 0..101 {
                    value = !value;
                    controller.write(pin, value).unwrap();
                    assert_eq!(controller.read(pin), Ok(value));
                }
            });
        }
    });

    for pin in pins {
        assert_eq!(backend.level(pin), Some(PinValue::High));
    }
}

#[cfg(not(feature = "hardware-gpio"))]
#[test]
fn from_config_uses_simulated_backend() {
    init_logging();
    let mut config = sample_config();
    config.numbering_scheme = PinNumberingScheme::Board;
    let controller = GpioController::from_config(&config).expect("controller");

    controller.open_pin_with_mode(11, PinMode::Output).unwrap();
    controller.write(11, PinValue::High).unwrap();
    assert_eq!(controller.read(11), Ok(PinValue::High));
    assert_eq!(controller.pin_count(), Ok(3));
}

#[test]
fn from_config_rejects_invalid_config() {
    let config = ControllerConfig {
        broadcast_capacity: 0,
        ..ControllerConfig::default()
    };
    assert!(matches!(
        GpioController::from_config(&config),
        Err(GpioError::Config(_))
    ));
}

#[test]
fn load_from_file_reads_json() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(
        br#"{
            "numbering_scheme": "board",
            "pins": { "17": { "name": "LED 1", "line": 17, "modes": ["output"] } },
            "board_layout": { "11": 17 },
            "event_history_capacity": 4
        }"#,
    )
    .expect("write config");
    file.flush().expect("flush config");

    let config = ControllerConfig::load_from_file(file.path()).expect("config loads");
    assert_eq!(config.numbering_scheme, PinNumberingScheme::Board);
    assert_eq!(config.event_history_capacity, 4);
    assert_eq!(config.pins[&17].name, "LED 1");
    assert_eq!(config.board_layout.to_logical(11), Some(17));
}

#[test]
fn load_from_file_validates() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(br#"{ "board_layout": { "3": 2, "5": 2 } }"#)
        .expect("write config");
    file.flush().expect("flush config");

    assert!(matches!(
        ControllerConfig::load_from_file(file.path()),
        Err(GpioError::Config(_))
    ));
}

#[test]
fn load_from_missing_file_is_config_error() {
    assert!(matches!(
        ControllerConfig::load_from_file("/nonexistent/gpioctl.json"),
        Err(GpioError::Config(_))
    ));
}

//! Bench bring-up diagnostics CLI (§6.5, added). Connects to an SMT
//! fixture, runs identification, reports supply voltage, de-energizes all
//! relays, and optionally runs one `test_panel` against a relay list given
//! on the command line. Not a supported UI feature (§1 Non-goals exclude
//! "all graphical UI, dialog flow, progress indication"); this is a
//! diagnostics convenience analogous to the teacher's own `main.rs` smoke
//! test and the pack's `examples/device_info.rs`.

use std::collections::BTreeSet;
use std::process::ExitCode;

use fixture_protocol_core::smt::{parse_relay_list, SmtController};
use fixture_protocol_core::ConnectConfig;

fn print_usage() {
    eprintln!("usage: smt_cli <port> [relay-list]");
    eprintln!("  <port>        serial port identifier, e.g. /dev/ttyUSB0 or COM3");
    eprintln!("  [relay-list]  optional, e.g. \"1,2,5-8\" or \"ALL\"; runs test_panel if given");
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::FAILURE;
    }
    let port = args[1].clone();
    let relay_list_arg = args.get(2).cloned();

    let config = ConnectConfig::new(vec![port]);

    let controller = match SmtController::connect(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("connect failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match controller.supply_voltage() {
        Ok(v) => println!("supply voltage: {:.2}V", v),
        Err(e) => eprintln!("supply_voltage failed: {}", e),
    }

    if let Err(e) = controller.all_off() {
        eprintln!("all_off failed: {}", e);
    } else {
        println!("all relays off");
    }

    if let Some(relay_list) = relay_list_arg {
        let relays: BTreeSet<u8> = match parse_relay_list(&relay_list) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("invalid relay list {:?}: {}", relay_list, e);
                controller.disconnect();
                return ExitCode::FAILURE;
            }
        };

        match controller.test_panel(&relays, &config) {
            Ok(measurements) => {
                let mut relays: Vec<_> = measurements.keys().copied().collect();
                relays.sort_unstable();
                for relay in relays {
                    let m = &measurements[&relay];
                    println!(
                        "relay {}: {:.3}V {:.3}A",
                        m.relay_index, m.voltage_volts, m.current_amps
                    );
                }
            }
            Err(e) => eprintln!("test_panel failed: {}", e),
        }
    }

    controller.disconnect();
    ExitCode::SUCCESS
}

use std::env;

use kiln::config::{self, Config, DRIVES};
use kiln::hardware::SimPlatform;
use kiln::motion::{MoveQueue, RequestedMove};
use kiln::printer::Printer;
use kiln::tool::Tool;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("Starting kiln motion/heat core demo");

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 1 { &args[1] } else { "printer.toml" };
    let config = match config::load_config(config_path) {
        Ok(config) => {
            tracing::info!("Loaded configuration from {}", config_path);
            config
        }
        Err(e) => {
            tracing::warn!("Using default configuration ({})", e);
            Config::default()
        }
    };

    let platform = SimPlatform::new(&config);
    let mut printer = Printer::new(&config, platform, MoveQueue::new());

    // One tool on the first extruder and the nozzle heater.
    let mut tool = Tool::new(0, vec![0], vec![1]).expect("valid demo tool");
    tool.set_variables(&[140.0], &[200.0], printer.heat_mut(), 0.0);
    printer.add_tool(tool).expect("first tool number is free");
    printer.select_tool(0).expect("tool 0 exists");

    // Warm up before moving.
    tracing::info!("Waiting for heaters");
    let mut warmed = false;
    for _ in 0..2_000 {
        printer.platform_mut().advance(0.1);
        printer.spin();
        if printer.heat().all_heaters_at_set_temperatures() {
            warmed = true;
            break;
        }
    }
    let nozzle = printer.heat().get_temperature(1);
    if warmed {
        tracing::info!("Heaters ready, nozzle at {:.1} C", nozzle);
    } else {
        tracing::warn!("Heaters not settled, nozzle at {:.1} C; moving anyway", nozzle);
    }
    if !printer.tool_can_drive(0) {
        tracing::warn!("Tool 0 is not ready to extrude");
    }

    // A small printed square: travel in, then four extruding edges.
    let corners = [
        (20.0, 20.0, None),
        (60.0, 20.0, Some(1.2)),
        (60.0, 60.0, Some(1.2)),
        (20.0, 60.0, Some(1.2)),
        (20.0, 20.0, Some(1.2)),
    ];
    for (x, y, extrusion) in corners {
        let mut end_point = [0.0; DRIVES];
        end_point[0] = x;
        end_point[1] = y;
        end_point[2] = 0.3;
        if let Some(e) = extrusion {
            if let Some(tool) = printer.tools().get(0) {
                for (drive, delta) in tool.mix_deltas(e) {
                    end_point[drive] = delta;
                }
            }
        }
        printer.source_mut().push(RequestedMove {
            end_point,
            feed_rate: if extrusion.is_some() { 40.0 } else { 120.0 },
            check_endstops: false,
        });
    }

    tracing::info!("Printing a 40 mm square");
    if !printer.run_until_idle(2_000_000) {
        tracing::warn!("Interrupt budget exhausted before the job finished");
    }

    let live = printer.motion().live_coordinates();
    tracing::info!(
        "Finished at X{:.2} Y{:.2} Z{:.2} after {:?} steps",
        live[0],
        live[1],
        live[2],
        printer.platform().step_counts()
    );
    printer.exit();
}

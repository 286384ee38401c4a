mod config;
mod console;

use crate::config::Config;
use charlcd_gpio::clock::{Clock, SystemClock};
use charlcd_gpio::gpiod::GpiodLines;
use charlcd_gpio::lcd::hd44780::{DisplayRegistry, DisplayWiring, Greeting};
use charlcd_gpio::sim::{self, SimClock, SimGpio};
use charlcd_gpio::GpioLines;
use dotenv::dotenv;
use eyre::{eyre, WrapErr};
use log::{debug, info, warn};
use std::env::var;
use std::sync::Arc;
use sysinfo::System;

const UNKNOWN_STR: &str = "???";

fn greeting(config: &Config) -> Greeting {
    let line1 = var("CHARLCD_LINE1").ok().or_else(|| config.line1.clone()).unwrap_or_else(|| {
        format!(
            "Linux {}",
            System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR)
        )
    });
    let line2 = var("CHARLCD_LINE2")
        .ok()
        .or_else(|| config.line2.clone())
        .unwrap_or_default();
    Greeting { line1, line2 }
}

fn main() -> eyre::Result<()> {
    // Initialize environment and logger
    dotenv().ok();
    pretty_env_logger::init();

    info!("charlcd starting...");
    info!(
        "System ver {} kernel ver {}",
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
    );
    info!(
        "Hostname {}",
        System::host_name().as_deref().unwrap_or(UNKNOWN_STR)
    );

    debug!("Trying to load config...");
    let config = match Config::try_load()? {
        Some(config) => {
            info!("Config loaded.");
            config
        }
        None => {
            info!("Config not found. Using default");
            Config::default()
        }
    };

    let dry_run = var("CHARLCD_DRY_RUN").is_ok();
    let mut wirings: Vec<DisplayWiring> =
        config.displays.iter().cloned().map(DisplayWiring::from).collect();

    let sim_gpio = dry_run.then(|| Arc::new(SimGpio::quiet()));
    let (gpio, clock): (Arc<dyn GpioLines>, Arc<dyn Clock>) = match &sim_gpio {
        Some(sim_gpio) => {
            info!("Dry run, driving simulated displays");
            if wirings.is_empty() {
                wirings.push(sim::wiring_at(0));
            }
            for wiring in &wirings {
                sim_gpio.attach_display(wiring);
            }
            (sim_gpio.clone(), Arc::new(SimClock::new()))
        }
        None => {
            let chip = var("CHARLCD_CHIP").unwrap_or_else(|_| "/dev/gpiochip0".to_string());
            let gpio = GpiodLines::open(&chip).wrap_err_with(|| format!("cannot open {}", chip))?;
            (Arc::new(gpio), Arc::new(SystemClock::new()))
        }
    };
    debug!("{:?} initialized.", gpio);

    if wirings.is_empty() {
        return Err(eyre!("no displays configured"));
    }

    let registry = DisplayRegistry::with_capacity(gpio, clock, config.capacity)
        .with_greeting(greeting(&config));
    let mut ids = Vec::new();
    for wiring in wirings {
        match registry.register(wiring) {
            Ok(id) => ids.push(id),
            Err(err) => warn!("Skipping display: {}", err),
        }
    }
    info!("Registered displays {:?}", ids);

    let id = match var("CHARLCD_DISPLAY") {
        Ok(id) => id.parse::<usize>().wrap_err("CHARLCD_DISPLAY is not a display id")?,
        Err(_) => 0,
    };
    let result = registry
        .open(id)
        .wrap_err_with(|| format!("cannot open display {}", id))
        .and_then(|_| {
            info!("Reading display {} input from stdin...", id);
            let result = console::run(&registry, id, std::io::stdin().lock(), std::io::stdout());
            registry.release(id)?;
            result
        });

    for id in ids {
        registry.deregister(id)?;
    }

    if let Some(sim_gpio) = sim_gpio {
        for display in 0..sim_gpio.display_count() {
            info!(
                "Simulated display {}: {:?} / {:?}",
                display,
                sim_gpio.ddram_line(display, 0),
                sim_gpio.ddram_line(display, 1)
            );
        }
    }

    info!("charlcd done.");
    result
}

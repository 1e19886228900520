use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::LevelFilter;

use raven_bootmenu::boot;
use raven_bootmenu::config::Settings;
use raven_bootmenu::menu::Menu;
use raven_bootmenu::logbuf;
use raven_bootmenu::scan::{CatalogBuilder, Scanner};
use raven_bootmenu::sys::{self, LinuxSys};
use raven_bootmenu::tui::{Keys, Tui};
use raven_bootmenu::ui::App;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("raven-bootmenu: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let log = logbuf::init(LevelFilter::Info).context("Failed to initialize logging")?;
    log::info!("raven-bootmenu {} starting", env!("CARGO_PKG_VERSION"));

    let init_mode = sys::is_init_process();
    if init_mode {
        log::info!("Running as init");
        sys::init_early_mounts(&mut LinuxSys)?;
    }

    let mut settings = Settings::load();
    match fs::read_to_string("/proc/cmdline") {
        Ok(cmdline) => settings.apply_cmdline_overrides(&cmdline),
        Err(e) => log::warn!("Can't read /proc/cmdline: {}", e),
    }
    if settings.debug {
        log::set_max_level(LevelFilter::Debug);
    }

    let mut scanner = CatalogBuilder::new(settings.clone(), LinuxSys);
    let registry = scanner.scan()?;
    log::info!("Scan found {} boot item(s)", registry.fill());

    let menu = Menu::build(&registry, init_mode);

    let mut tui = Tui::init_for(settings.ui).context("Failed to initialize the UI")?;
    // With the alternate screen active, stderr echo would scribble over
    // the frames; the in-memory buffer keeps feeding the debug view.
    log.set_echo(false);
    let mut input = Keys;

    let mut sys = LinuxSys;
    let mut app =
        App::new(&settings, registry, menu, &mut scanner, &mut sys, log.clone(), init_mode);
    let choice = app.run(&mut tui, &mut input)?;

    let item = app
        .registry
        .item(choice)
        .context("selected boot item disappeared from the registry")?
        .clone();
    drop(app);

    // Restore the console before handing it to the next kernel.
    drop(tui);
    log.set_echo(true);

    log::info!("Booting '{}'", item.display_label());
    match boot::boot(&mut LinuxSys, &settings, &item) {
        Ok(never) => match never {},
        Err(e) => {
            log::error!("Boot failed: {}", e);
            Err(e.into())
        }
    }
}

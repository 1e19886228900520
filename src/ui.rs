//! UI context state machine and the synchronous event loop driving it.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::catalog::BootConfig;
use crate::config::Settings;
use crate::logbuf::LogHandle;
use crate::menu::{self, Menu, MenuAction};
use crate::scan::Scanner;
use crate::sys::SysOps;

/// Abstract input action. The closed set every input backend maps its
/// events onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Up,
    Down,
    Select,
    /// Numeric quick-select of a menu position.
    Digit(u8),
    Rescan,
    Reboot,
    Shutdown,
    Debug,
    Exit,
    /// The autoboot timeout expired without input.
    Timeout,
    Error,
}

/// Which handler receives the next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Menu,
    TextView,
}

/// Result of dispatching one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Redraw the active context and keep looping.
    Continue,
    /// Stop the loop; the registry item at this index was chosen.
    Selected(usize),
    /// Stop the loop with an error.
    Error,
}

/// Draw side of the UI. The state machine issues identical calls to
/// whichever backend was initialized.
pub trait Renderer {
    fn show_menu(&mut self, menu: &Menu) -> Result<()>;
    fn show_text(&mut self, lines: &[String], top: usize) -> Result<()>;
    fn show_message(&mut self, message: &str) -> Result<()>;
}

/// Input side of the UI. Blocks until the next abstract action; when a
/// timeout is armed, its expiry surfaces as `Action::Timeout`.
pub trait InputSource {
    fn next_action(&mut self, timeout: Option<Duration>) -> Result<Action>;
}

/// Everything the event loop and the context handlers operate on.
pub struct App<'a> {
    settings: &'a Settings,
    pub registry: BootConfig,
    pub menu: Menu,
    pub context: Context,
    scanner: &'a mut dyn Scanner,
    sys: &'a mut dyn SysOps,
    log: LogHandle,
    /// First visible line of the text log viewport.
    view_top: usize,
    init_mode: bool,
}

impl<'a> App<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &'a Settings,
        registry: BootConfig,
        menu: Menu,
        scanner: &'a mut dyn Scanner,
        sys: &'a mut dyn SysOps,
        log: LogHandle,
        init_mode: bool,
    ) -> Self {
        Self {
            settings,
            registry,
            menu,
            context: Context::Menu,
            scanner,
            sys,
            log,
            view_top: 0,
            init_mode,
        }
    }

    /// Run the event loop until a boot item is selected. One dispatch and
    /// at most one redraw per received action; `Action::None` loops
    /// without dispatching.
    pub fn run(&mut self, renderer: &mut dyn Renderer, input: &mut dyn InputSource) -> Result<usize> {
        self.context = Context::Menu;
        self.draw(renderer)?;

        // The autoboot timeout stays armed until the first real action.
        let mut armed = self.registry.timeout > 0;

        loop {
            let timeout = if armed {
                Some(Duration::from_secs(u64::from(self.registry.timeout)))
            } else {
                None
            };

            let action = input.next_action(timeout)?;
            if action == Action::None {
                continue;
            }
            if action != Action::Timeout {
                armed = false;
            }

            let outcome = match self.context {
                Context::Menu => self.handle_menu(action, renderer),
                Context::TextView => self.handle_textview(action),
            };

            match outcome {
                Outcome::Continue => self.draw(renderer)?,
                Outcome::Selected(index) => return Ok(index),
                Outcome::Error => bail!("no boot item selected"),
            }
        }
    }

    fn draw(&self, renderer: &mut dyn Renderer) -> Result<()> {
        match self.context {
            Context::Menu => renderer.show_menu(&self.menu),
            Context::TextView => {
                let lines = self.log.lines();
                renderer.show_text(&lines, self.view_top)
            }
        }
    }

    /// Dispatch one action in the menu context.
    pub fn handle_menu(&mut self, action: Action, renderer: &mut dyn Renderer) -> Outcome {
        let menu_action = match action {
            Action::None => return Outcome::Continue,
            Action::Up => {
                self.menu.move_selection(-1);
                return Outcome::Continue;
            }
            Action::Down => {
                self.menu.move_selection(1);
                return Outcome::Continue;
            }
            Action::Select => self.menu.current_item().action,
            Action::Digit(n) => {
                if !self.menu.select_position(usize::from(n)) {
                    // No item at that position.
                    return Outcome::Continue;
                }
                self.menu.current_item().action
            }
            Action::Rescan => MenuAction::Rescan,
            Action::Reboot => MenuAction::Reboot,
            Action::Shutdown => MenuAction::Shutdown,
            Action::Debug => MenuAction::Debug,
            Action::Exit => MenuAction::Exit,
            Action::Timeout => {
                return match self.menu.select_first_boot_entry() {
                    Some(index) => Outcome::Selected(index),
                    None => Outcome::Continue,
                };
            }
            Action::Error => return Outcome::Error,
        };

        match menu_action {
            MenuAction::Boot(index) => Outcome::Selected(index),
            MenuAction::Submenu(level) => {
                self.menu.enter_submenu(level);
                Outcome::Continue
            }
            MenuAction::Parent => {
                self.menu.leave_submenu();
                Outcome::Continue
            }
            MenuAction::Rescan => {
                if let Err(e) = renderer.show_message("Rescanning devices.\nPlease wait...") {
                    log::warn!("Can't show message: {:#}", e);
                }
                match self.rescan() {
                    Ok(()) => Outcome::Continue,
                    Err(e) => {
                        log::error!("Rescan failed: {:#}", e);
                        Outcome::Error
                    }
                }
            }
            MenuAction::Reboot => {
                if let Err(e) = renderer.show_message("Rebooting...") {
                    log::warn!("Can't show message: {:#}", e);
                }
                if self.settings.host_debug {
                    std::thread::sleep(Duration::from_secs(1));
                } else if let Err(e) = self.sys.reboot() {
                    log::error!("Can't initiate reboot: {:#}", e);
                }
                Outcome::Continue
            }
            MenuAction::Shutdown => {
                if let Err(e) = renderer.show_message("Shutting down...") {
                    log::warn!("Can't show message: {:#}", e);
                }
                if self.settings.host_debug {
                    std::thread::sleep(Duration::from_secs(1));
                } else if let Err(e) = self.sys.poweroff() {
                    log::error!("Can't initiate shutdown: {:#}", e);
                }
                Outcome::Continue
            }
            MenuAction::Debug => {
                self.context = Context::TextView;
                Outcome::Continue
            }
            MenuAction::Exit => {
                if self.init_mode {
                    // Init can't exit.
                    Outcome::Continue
                } else {
                    Outcome::Error
                }
            }
        }
    }

    /// Dispatch one action in the text log context.
    pub fn handle_textview(&mut self, action: Action) -> Outcome {
        match action {
            Action::Up => {
                if self.view_top > 0 {
                    self.view_top -= 1;
                }
                Outcome::Continue
            }
            Action::Down => {
                if self.view_top + 1 < self.log.len() {
                    self.view_top += 1;
                }
                Outcome::Continue
            }
            Action::Select => {
                // Rewind so the log view stays usable on devices with
                // only DOWN and SELECT buttons.
                self.view_top = 0;
                self.context = Context::Menu;
                Outcome::Continue
            }
            Action::Exit if !self.init_mode => Outcome::Error,
            Action::Error => Outcome::Error,
            _ => Outcome::Continue,
        }
    }

    /// Tear the current registry and top-level menu entries down, then
    /// build both anew. The old resources are fully released before the
    /// new scan starts.
    fn rescan(&mut self) -> Result<()> {
        self.menu.clear_boot_entries();
        let old = std::mem::take(&mut self.registry);
        drop(old);

        self.registry = self.scanner.scan()?;
        let added = menu::fill_boot_entries(&mut self.menu, &self.registry);
        log::info!("Rescan found {} boot item(s)", added);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BootItem, BootType, DeviceType, Icon};
    use crate::sys::testing::FakeSys;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn item(device: &str, priority: i32) -> BootItem {
        BootItem {
            device: device.to_string(),
            fstype: "ext4".to_string(),
            blocks: 1024,
            label: None,
            kernel: PathBuf::from("/boot/zImage"),
            cmdline: None,
            initrd: None,
            directory: None,
            image: None,
            image_path: None,
            icon: None,
            dtype: DeviceType::from_device_path(device),
            boot_type: BootType::default(),
            priority,
        }
    }

    fn registry(priorities: &[i32]) -> BootConfig {
        let mut registry = BootConfig::new();
        for (i, &priority) in priorities.iter().enumerate() {
            registry.push(item(&format!("/dev/sda{}", i + 1), priority));
        }
        registry
    }

    #[derive(Default)]
    struct FakeRenderer {
        menus: usize,
        texts: usize,
        messages: Vec<String>,
    }

    impl Renderer for FakeRenderer {
        fn show_menu(&mut self, _menu: &Menu) -> Result<()> {
            self.menus += 1;
            Ok(())
        }

        fn show_text(&mut self, _lines: &[String], _top: usize) -> Result<()> {
            self.texts += 1;
            Ok(())
        }

        fn show_message(&mut self, message: &str) -> Result<()> {
            self.messages.push(message.to_string());
            Ok(())
        }
    }

    struct ScriptedInput {
        actions: VecDeque<Action>,
        timeouts: Vec<Option<Duration>>,
    }

    impl ScriptedInput {
        fn new(actions: &[Action]) -> Self {
            Self { actions: actions.iter().copied().collect(), timeouts: Vec::new() }
        }
    }

    impl InputSource for ScriptedInput {
        fn next_action(&mut self, timeout: Option<Duration>) -> Result<Action> {
            self.timeouts.push(timeout);
            Ok(self.actions.pop_front().unwrap_or(Action::Error))
        }
    }

    #[derive(Default)]
    struct FakeScanner {
        next: Option<BootConfig>,
        calls: usize,
    }

    impl Scanner for FakeScanner {
        fn scan(&mut self) -> Result<BootConfig> {
            self.calls += 1;
            Ok(self.next.take().unwrap_or_default())
        }
    }

    fn app<'a>(
        settings: &'a Settings,
        registry: BootConfig,
        scanner: &'a mut dyn Scanner,
        sys: &'a mut dyn SysOps,
        init_mode: bool,
    ) -> App<'a> {
        let menu = Menu::build(&registry, init_mode);
        App::new(settings, registry, menu, scanner, sys, LogHandle::default(), init_mode)
    }

    #[test]
    fn test_empty_scan_end_to_end() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut app = app(&settings, BootConfig::new(), &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        // Up/Down are no-ops on the lone System entry; Select enters the
        // submenu; Select on Back returns to the top; Exit stops.
        let mut input =
            ScriptedInput::new(&[Action::Down, Action::Up, Action::Select, Action::Select, Action::Exit]);

        assert!(app.run(&mut renderer, &mut input).is_err());
        assert_eq!(app.menu.current, 0);
        assert_eq!(app.menu.current_level().current, 0);
        // Initial draw plus one redraw per continue outcome; no redraw
        // after the terminating Exit.
        assert_eq!(renderer.menus, 5);
    }

    #[test]
    fn test_selecting_boot_entry_yields_its_registry_index() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        // Item 1 has the higher priority and sorts first.
        let mut app = app(&settings, registry(&[1, 9]), &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        let mut input = ScriptedInput::new(&[Action::Down, Action::Select]);

        assert_eq!(app.run(&mut renderer, &mut input).unwrap(), 1);
    }

    #[test]
    fn test_timeout_selects_first_boot_entry() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut reg = registry(&[3]);
        reg.timeout = 5;
        let mut app = app(&settings, reg, &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        let mut input = ScriptedInput::new(&[Action::Timeout]);

        assert_eq!(app.run(&mut renderer, &mut input).unwrap(), 0);
        assert_eq!(input.timeouts, vec![Some(Duration::from_secs(5))]);
    }

    #[test]
    fn test_timeout_without_boot_entries_continues() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut reg = BootConfig::new();
        reg.timeout = 5;
        let mut app = app(&settings, reg, &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        let mut input = ScriptedInput::new(&[Action::Timeout, Action::Exit]);

        assert!(app.run(&mut renderer, &mut input).is_err());
        // The timeout produced a redraw, not a selection.
        assert_eq!(renderer.menus, 2);
        // The timeout stays armed across its own expiry.
        assert_eq!(
            input.timeouts,
            vec![Some(Duration::from_secs(5)), Some(Duration::from_secs(5))]
        );
    }

    #[test]
    fn test_first_real_action_disarms_timeout() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut reg = registry(&[1]);
        reg.timeout = 5;
        let mut app = app(&settings, reg, &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        let mut input = ScriptedInput::new(&[Action::Down, Action::Exit]);

        assert!(app.run(&mut renderer, &mut input).is_err());
        assert_eq!(input.timeouts, vec![Some(Duration::from_secs(5)), None]);
    }

    #[test]
    fn test_digit_quick_select() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut app = app(&settings, registry(&[9, 1]), &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        // Position 0 is the System entry, position 2 the lower-priority
        // boot item (registry index 1).
        let mut input = ScriptedInput::new(&[Action::Digit(2)]);
        assert_eq!(app.run(&mut renderer, &mut input).unwrap(), 1);
    }

    #[test]
    fn test_digit_out_of_range_is_noop() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut app = app(&settings, registry(&[1]), &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Digit(7), &mut renderer), Outcome::Continue);
        assert_eq!(app.menu.current_level().current, 0);
    }

    #[test]
    fn test_exit_is_suppressed_in_init_mode() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut app = app(&settings, BootConfig::new(), &mut scanner, &mut sys, true);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Exit, &mut renderer), Outcome::Continue);
        assert_eq!(app.handle_textview(Action::Exit), Outcome::Continue);
    }

    #[test]
    fn test_reboot_and_shutdown_stay_in_loop() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let mut app = app(&settings, BootConfig::new(), &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Reboot, &mut renderer), Outcome::Continue);
        assert_eq!(app.handle_menu(Action::Shutdown, &mut renderer), Outcome::Continue);
        assert_eq!(renderer.messages, vec!["Rebooting...", "Shutting down..."]);

        drop(app);
        assert_eq!(sys.reboots, 1);
        assert_eq!(sys.poweroffs, 1);
    }

    #[test]
    fn test_debug_enters_textview_and_select_returns() {
        let settings = Settings::default();
        let mut scanner = FakeScanner::default();
        let mut sys = FakeSys::default();
        let log = LogHandle::default();
        log.push("INFO: one".to_string());
        log.push("INFO: two".to_string());
        log.push("INFO: three".to_string());

        let reg = BootConfig::new();
        let menu = Menu::build(&reg, false);
        let mut app = App::new(&settings, reg, menu, &mut scanner, &mut sys, log, false);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Debug, &mut renderer), Outcome::Continue);
        assert_eq!(app.context, Context::TextView);

        // The viewport clamps at both ends.
        assert_eq!(app.handle_textview(Action::Up), Outcome::Continue);
        assert_eq!(app.view_top, 0);
        for _ in 0..5 {
            app.handle_textview(Action::Down);
        }
        assert_eq!(app.view_top, 2);

        assert_eq!(app.handle_textview(Action::Select), Outcome::Continue);
        assert_eq!(app.context, Context::Menu);
        assert_eq!(app.view_top, 0);
    }

    #[test]
    fn test_rescan_rebuilds_menu_from_new_registry() {
        let settings = Settings::default();
        let mut scanner = FakeScanner { next: Some(registry(&[4, 2])), calls: 0 };
        let mut sys = FakeSys::default();
        let mut app = app(&settings, registry(&[1]), &mut scanner, &mut sys, false);
        assert_eq!(app.menu.boot_entry_count(), 1);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Rescan, &mut renderer), Outcome::Continue);
        assert_eq!(app.menu.boot_entry_count(), 2);
        assert_eq!(app.registry.fill(), 2);
        assert!(renderer.messages[0].starts_with("Rescanning"));

        drop(app);
        assert_eq!(scanner.calls, 1);
    }

    /// Asserts that the old registry and menu entries are destroyed
    /// before the new scan builds anything.
    struct IconCountingScanner {
        probe: Arc<[u8]>,
        released_before_scan: Option<bool>,
    }

    impl Scanner for IconCountingScanner {
        fn scan(&mut self) -> Result<BootConfig> {
            self.released_before_scan = Some(Arc::strong_count(&self.probe) == 1);
            Ok(BootConfig::new())
        }
    }

    #[test]
    fn test_rescan_releases_icons_before_new_scan() {
        let settings = Settings::default();
        let probe: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);

        let mut reg = registry(&[1]);
        let mut with_icon = item("/dev/sdb1", 5);
        with_icon.icon = Some(Icon { data: probe.clone() });
        reg.push(with_icon);

        let mut scanner = IconCountingScanner { probe, released_before_scan: None };
        let mut sys = FakeSys::default();

        // The scanner, the registry item and its menu entry each hold
        // the icon data until the rescan tears the latter two down.
        let mut app = app(&settings, reg, &mut scanner, &mut sys, false);

        let mut renderer = FakeRenderer::default();
        assert_eq!(app.handle_menu(Action::Rescan, &mut renderer), Outcome::Continue);

        drop(app);
        assert_eq!(scanner.released_before_scan, Some(true));
        assert_eq!(Arc::strong_count(&scanner.probe), 1);
    }
}

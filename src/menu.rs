//! Two-level boot menu: the top level with the boot items and one
//! "System" entry, and the system level with the maintenance actions.

use crate::catalog::{BootConfig, Icon};

/// What selecting a menu item does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    /// Boot the registry item at this index.
    Boot(usize),
    /// Descend into a submenu level.
    Submenu(LevelId),
    /// Go back to the parent level.
    Parent,
    Rescan,
    Reboot,
    Shutdown,
    Debug,
    Exit,
}

pub type LevelId = usize;

#[derive(Debug)]
pub struct MenuItem {
    pub action: MenuAction,
    pub label: String,
    pub description: Option<String>,
    pub icon: Option<Icon>,
    /// Device type tag rendered next to boot entries. System entries
    /// carry none.
    pub tag: Option<&'static str>,
}

#[derive(Debug)]
pub struct MenuLevel {
    pub items: Vec<MenuItem>,
    /// Index of the selected item. Exactly one item per level is current.
    pub current: usize,
    pub parent: Option<LevelId>,
}

/// The menu owns all its levels and items. Boot entries reference
/// registry items by index, so a rescan invalidates and rebuilds the
/// whole top level.
#[derive(Debug)]
pub struct Menu {
    levels: Vec<MenuLevel>,
    top: LevelId,
    pub current: LevelId,
}

impl Menu {
    /// Build the fixed System submenu and the top level, then project
    /// the registry's boot items into the top level.
    pub fn build(registry: &BootConfig, init_mode: bool) -> Menu {
        let top = MenuLevel { items: Vec::with_capacity(4), current: 0, parent: None };
        let mut system = MenuLevel { items: Vec::with_capacity(6), current: 0, parent: Some(0) };

        system.items.push(MenuItem {
            action: MenuAction::Parent,
            label: "Back".to_string(),
            description: None,
            icon: None,
            tag: None,
        });
        system.items.push(MenuItem {
            action: MenuAction::Rescan,
            label: "Rescan".to_string(),
            description: None,
            icon: None,
            tag: None,
        });
        system.items.push(MenuItem {
            action: MenuAction::Debug,
            label: "Show debug info".to_string(),
            description: None,
            icon: None,
            tag: None,
        });
        system.items.push(MenuItem {
            action: MenuAction::Reboot,
            label: "Reboot".to_string(),
            description: None,
            icon: None,
            tag: None,
        });
        system.items.push(MenuItem {
            action: MenuAction::Shutdown,
            label: "Shutdown".to_string(),
            description: None,
            icon: None,
            tag: None,
        });
        if !init_mode {
            system.items.push(MenuItem {
                action: MenuAction::Exit,
                label: "Exit".to_string(),
                description: None,
                icon: None,
                tag: None,
            });
        }

        let mut menu = Menu { levels: vec![top, system], top: 0, current: 0 };
        menu.levels[0].items.push(MenuItem {
            action: MenuAction::Submenu(1),
            label: "System menu".to_string(),
            description: None,
            icon: None,
            tag: None,
        });

        fill_boot_entries(&mut menu, registry);
        menu
    }

    pub fn top_level(&self) -> &MenuLevel {
        &self.levels[self.top]
    }

    pub fn current_level(&self) -> &MenuLevel {
        &self.levels[self.current]
    }

    fn current_level_mut(&mut self) -> &mut MenuLevel {
        &mut self.levels[self.current]
    }

    pub fn current_item(&self) -> &MenuItem {
        let level = self.current_level();
        &level.items[level.current]
    }

    /// Move the selection cursor, wrapping at both ends.
    pub fn move_selection(&mut self, delta: i32) {
        let level = self.current_level_mut();
        let count = level.items.len() as i32;
        if count == 0 {
            return;
        }
        level.current = (level.current as i32 + delta).rem_euclid(count) as usize;
    }

    /// Numeric quick-select: make the item at `position` current.
    /// Returns false when the current level has no such position.
    pub fn select_position(&mut self, position: usize) -> bool {
        let level = self.current_level_mut();
        if position >= level.items.len() {
            return false;
        }
        level.current = position;
        true
    }

    /// Descend into a submenu level.
    pub fn enter_submenu(&mut self, level: LevelId) {
        if level < self.levels.len() {
            self.current = level;
        }
    }

    /// Return to the parent level. No-op at the top level.
    pub fn leave_submenu(&mut self) {
        if let Some(parent) = self.current_level().parent {
            self.current = parent;
        }
    }

    /// Number of boot entries in the top level (the System entry does
    /// not count).
    pub fn boot_entry_count(&self) -> usize {
        self.levels[self.top].items.len().saturating_sub(1)
    }

    /// Drop every boot entry from the top level, keeping the System
    /// entry. Used before a rescan rebuilds the catalog.
    pub fn clear_boot_entries(&mut self) {
        let top = &mut self.levels[self.top];
        top.items.truncate(1);
        top.current = 0;
    }

    /// Make the first boot entry current and return its registry index,
    /// if any boot entry exists. Used by the autoboot timeout.
    pub fn select_first_boot_entry(&mut self) -> Option<usize> {
        let top = &mut self.levels[self.top];
        match top.items.get(1).map(|item| item.action) {
            Some(MenuAction::Boot(index)) => {
                top.current = 1;
                self.current = self.top;
                Some(index)
            }
            _ => None,
        }
    }
}

/// Append one top-level entry per boot item, ordered by descending
/// priority; an item that ties an earlier one keeps the later slot.
/// Returns the number of entries added.
pub fn fill_boot_entries(menu: &mut Menu, registry: &BootConfig) -> usize {
    let items = registry.items();
    if items.is_empty() {
        log::info!("No items for menu found");
        return 0;
    }

    log::info!("Populating menu: {} item(s)", items.len());

    let mut order: Vec<usize> = (0..items.len()).collect();
    // Stable sort: equal priorities stay in scan order.
    order.sort_by(|&a, &b| items[b].priority.cmp(&items[a].priority));

    for index in order {
        let item = &items[index];
        let label = item.display_label();
        let description =
            format!("{} {} {}Mb", item.device, item.fstype, item.blocks / 1024);

        log::info!("+ [{}]", label);
        menu.levels[menu.top].items.push(MenuItem {
            action: MenuAction::Boot(index),
            label,
            description: Some(description),
            icon: item.icon.clone(),
            tag: Some(item.dtype.tag()),
        });
    }

    items.len()
}

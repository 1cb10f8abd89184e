//! Command registry: monotone IDs, per-client fan-out views, check-ins.
//!
//! Pure state: no I/O, no channels. The controller holds one behind a
//! lock and never holds that lock across a send.

use std::collections::BTreeMap;

use ron_proto::{ClientSnapshot, Command};

#[derive(Debug, Default)]
pub struct CommandRegistry {
    next_id: u64,
    commands: BTreeMap<u64, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next ID and insert. The command never mutates after
    /// this except for `sent` and `checked_in`.
    pub fn insert(&mut self, mut command: Command) -> u64 {
        self.next_id += 1;
        command.id = self.next_id;
        self.commands.insert(command.id, command);
        self.next_id
    }

    pub fn delete(&mut self, id: u64) -> bool {
        self.commands.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn get(&self, id: u64) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Build the view of commands a client should receive.
    ///
    /// A command is included iff its ID exceeds the client's high-water
    /// mark, the filter matches, and, for once-commands, nobody has
    /// received it yet (in which case it is marked sent). The high-water
    /// mark advances to the highest ID considered either way.
    pub fn view_for(
        &mut self,
        client: &ClientSnapshot,
        max_command_id: &mut u64,
    ) -> BTreeMap<u64, Command> {
        let mut view = BTreeMap::new();
        let mut highest = *max_command_id;
        let floor = *max_command_id;

        for (id, command) in self.commands.range_mut((
            std::ops::Bound::Excluded(floor),
            std::ops::Bound::Unbounded,
        )) {
            highest = highest.max(*id);
            if let Some(filter) = &command.filter {
                if !filter.matches(client) {
                    continue;
                }
            }
            if command.once {
                if command.sent {
                    continue;
                }
                command.sent = true;
            }
            view.insert(*id, command.clone());
        }

        *max_command_id = highest;
        view
    }

    /// Record an acknowledgement. The UUID appears at most once even
    /// under repeated delivery. Returns false if the command is gone.
    pub fn check_in(&mut self, id: u64, uuid: &str) -> bool {
        match self.commands.get_mut(&id) {
            Some(command) => {
                command.check_in(uuid);
                true
            }
            None => false,
        }
    }
}

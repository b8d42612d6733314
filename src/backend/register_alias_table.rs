use crate::cpu::ArgRegFile;
use crate::instructions::instructions::{RegisterType, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RATEntry {
    // the architectural value is the latest value of the register
    Ready(WordType),
    // the register will be written by the in flight instruction in this ROB slot
    Pending(u16),
}

/// The Register Alias Table. This structure is used for the register
/// renaming process. The RAT entry for a given architectural register
/// either contains its value or the tag (ROB slot) of the youngest in
/// flight instruction that writes it.
pub(crate) struct RAT {
    pub(crate) table: Vec<RATEntry>,
}

impl RAT {
    pub fn new(arch_reg_count: u16) -> Self {
        let mut table = Vec::with_capacity(arch_reg_count as usize);
        for _ in 0..arch_reg_count {
            table.push(RATEntry::Ready(0));
        }
        Self { table }
    }

    pub fn get(&self, arch_reg: RegisterType) -> RATEntry {
        self.table[arch_reg as usize]
    }

    pub fn set_pending(&mut self, arch_reg: RegisterType, tag: u16) {
        self.table[arch_reg as usize] = RATEntry::Pending(tag);
    }

    pub fn set_ready(&mut self, arch_reg: RegisterType, value: WordType) {
        self.table[arch_reg as usize] = RATEntry::Ready(value);
    }

    /// Every register reverts to its architectural value.
    pub fn reset(&mut self, arch_reg_file: &ArgRegFile) {
        for (arch_reg, entry) in self.table.iter_mut().enumerate() {
            *entry = RATEntry::Ready(arch_reg_file.get_value(arch_reg as RegisterType));
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = (RegisterType, u16)> + '_ {
        self.table.iter().enumerate().filter_map(|(arch_reg, entry)| match entry {
            RATEntry::Pending(tag) => Some((arch_reg as RegisterType, *tag)),
            RATEntry::Ready(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let mut rat = RAT::new(4);
        rat.set_pending(1, 3);
        rat.set_pending(1, 7);
        assert_eq!(rat.get(1), RATEntry::Pending(7));
        assert_eq!(rat.pending().collect::<Vec<_>>(), vec![(1, 7)]);
    }

    #[test]
    fn test_reset_to_architectural_state() {
        let mut arch_reg_file = ArgRegFile::new(4);
        arch_reg_file.set_value(2, 42);

        let mut rat = RAT::new(4);
        rat.set_pending(2, 0);
        rat.set_pending(3, 1);
        rat.reset(&arch_reg_file);

        assert_eq!(rat.get(2), RATEntry::Ready(42));
        assert_eq!(rat.get(3), RATEntry::Ready(0));
        assert_eq!(rat.pending().count(), 0);
    }
}

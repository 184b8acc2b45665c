//! Per-vat capability tables and vref/kref translation.

use crate::error::{KernelError, SyscallError};
use crate::keeper::KernelKeeper;
use swing_abi::{KernelSlot, VatId, VatSlot};

/// One c-list row, keyed by kref.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClistEntry {
    pub vref: VatSlot,
    /// Whether the vat can still reach the object (`R`) or only recognize it (`_`).
    pub reachable: bool,
}

impl ClistEntry {
    fn encode(&self) -> String {
        let flag = if self.reachable { 'R' } else { '_' };
        format!("{flag} {}", self.vref)
    }

    fn decode(raw: &str) -> Result<Self, KernelError> {
        let (flag, vref) = raw
            .split_once(' ')
            .ok_or_else(|| KernelError::corrupt(format!("bad c-list entry '{raw}'")))?;
        let reachable = match flag {
            "R" => true,
            "_" => false,
            _ => return Err(KernelError::corrupt(format!("bad c-list flag in '{raw}'"))),
        };
        Ok(Self {
            vref: vref.parse()?,
            reachable,
        })
    }
}

fn kref_key(vat: VatId, kref: KernelSlot) -> String {
    format!("{vat}.c.{kref}")
}

fn vref_key(vat: VatId, vref: VatSlot) -> String {
    format!("{vat}.c.{vref}")
}

impl KernelKeeper {
    pub fn clist_entry(&self, vat: VatId, kref: KernelSlot) -> Result<Option<ClistEntry>, KernelError> {
        match self.get(&kref_key(vat, kref))? {
            Some(raw) => Ok(Some(ClistEntry::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn clist_kref(&self, vat: VatId, vref: VatSlot) -> Result<Option<KernelSlot>, KernelError> {
        match self.get(&vref_key(vat, vref))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Every row of a vat's c-list, in kref order.
    pub fn clist_entries(&self, vat: VatId) -> Result<Vec<(KernelSlot, ClistEntry)>, KernelError> {
        self.store()
            .prefixed(&format!("{vat}.c.k"))?
            .into_iter()
            .map(|(key, raw)| {
                let kref = key
                    .rsplit('.')
                    .next()
                    .ok_or_else(|| KernelError::corrupt(format!("bad c-list key '{key}'")))?
                    .parse()?;
                Ok((kref, ClistEntry::decode(&raw)?))
            })
            .collect()
    }

    /// Refcount effect of a c-list row existing. Exports of objects count
    /// nothing: the owner's own entry is not a reference.
    fn clist_incref(&mut self, kref: KernelSlot, entry: &ClistEntry) -> Result<(), KernelError> {
        match kref {
            KernelSlot::Object(_) if entry.vref.is_import() => {
                self.adjust_object_refcount(kref, i64::from(entry.reachable), 1)
            }
            KernelSlot::Promise(_) => self.incref(kref),
            _ => Ok(()),
        }
    }

    fn clist_decref(&mut self, kref: KernelSlot, entry: &ClistEntry) -> Result<(), KernelError> {
        match kref {
            // retired objects are deleted before their importers hear about it
            KernelSlot::Object(_) if entry.vref.is_import() && !self.object_exists(kref)? => Ok(()),
            KernelSlot::Object(_) if entry.vref.is_import() => {
                self.adjust_object_refcount(kref, -i64::from(entry.reachable), -1)
            }
            KernelSlot::Object(_) => {
                self.maybe_free.insert(kref);
                Ok(())
            }
            KernelSlot::Promise(_) => self.decref(kref),
            KernelSlot::Device(_) => Ok(()),
        }
    }

    pub(crate) fn add_clist_entry(
        &mut self,
        vat: VatId,
        kref: KernelSlot,
        vref: VatSlot,
        reachable: bool,
    ) -> Result<(), KernelError> {
        if self.has(&kref_key(vat, kref))? || self.has(&vref_key(vat, vref))? {
            return Err(KernelError::panic(format!(
                "{vat} c-list already maps {kref} or {vref}"
            )));
        }
        let entry = ClistEntry { vref, reachable };
        self.set(kref_key(vat, kref), entry.encode());
        self.set(vref_key(vat, vref), kref.to_string());
        self.clist_incref(kref, &entry)
    }

    pub(crate) fn delete_clist_entry(&mut self, vat: VatId, kref: KernelSlot) -> Result<Option<ClistEntry>, KernelError> {
        let Some(entry) = self.clist_entry(vat, kref)? else {
            return Ok(None);
        };
        self.delete(&kref_key(vat, kref));
        self.delete(&vref_key(vat, entry.vref));
        self.clist_decref(kref, &entry)?;
        Ok(Some(entry))
    }

    pub(crate) fn set_reachable_flag(&mut self, vat: VatId, kref: KernelSlot) -> Result<(), KernelError> {
        let mut entry = self
            .clist_entry(vat, kref)?
            .ok_or_else(|| KernelError::panic(format!("{vat} has no c-list entry for {kref}")))?;
        if entry.reachable {
            return Ok(());
        }
        entry.reachable = true;
        self.set(kref_key(vat, kref), entry.encode());
        if kref.is_object() && entry.vref.is_import() {
            self.adjust_object_refcount(kref, 1, 0)?;
        }
        Ok(())
    }

    pub(crate) fn clear_reachable_flag(&mut self, vat: VatId, kref: KernelSlot) -> Result<(), KernelError> {
        let mut entry = self
            .clist_entry(vat, kref)?
            .ok_or_else(|| KernelError::panic(format!("{vat} has no c-list entry for {kref}")))?;
        if !entry.reachable {
            return Ok(());
        }
        entry.reachable = false;
        self.set(kref_key(vat, kref), entry.encode());
        if kref.is_object() && entry.vref.is_import() {
            self.adjust_object_refcount(kref, -1, 0)?;
        } else if kref.is_object() {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    fn allocate_import(&mut self, vat: VatId, kref: KernelSlot) -> Result<VatSlot, KernelError> {
        Ok(match kref {
            KernelSlot::Object(_) => VatSlot::import(self.allocate(&format!("{vat}.o.nextID"))?),
            KernelSlot::Promise(_) => VatSlot::promise_import(self.allocate(&format!("{vat}.p.nextID"))?),
            KernelSlot::Device(_) => VatSlot::device_import(self.allocate(&format!("{vat}.d.nextID"))?),
        })
    }

    // ---------------------------------------------------------------------
    // Translation
    // ---------------------------------------------------------------------

    /// Translate a vref a vat is *using* (send target, argument, result,
    /// resolution). Unknown exports become new kernel objects or promises;
    /// imports must exist and be reachable.
    pub(crate) fn map_vat_slot_to_kernel(&mut self, vat: VatId, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        if let Some(kref) = self.clist_kref(vat, vref)? {
            if vref.is_object() {
                let entry = self
                    .clist_entry(vat, kref)?
                    .ok_or_else(|| KernelError::panic(format!("{vat} c-list is one-sided for {vref}")))?;
                if !entry.reachable {
                    if vref.is_import() {
                        return Err(SyscallError::fatal(format!(
                            "{vat} used unreachable import {vref}"
                        )));
                    }
                    self.set_reachable_flag(vat, kref)?;
                }
            }
            return Ok(kref);
        }
        if !vref.is_export() {
            return Err(SyscallError::fatal(format!("{vat} used unknown import {vref}")));
        }
        let kref = match vref {
            VatSlot::Object { .. } => self.add_kernel_object(Some(vat))?,
            VatSlot::Promise { .. } => self.add_kernel_promise(Some(vat))?,
            VatSlot::Device { .. } => {
                return Err(SyscallError::fatal(format!("{vat} cannot export device node {vref}")));
            }
        };
        self.add_clist_entry(vat, kref, vref, true)?;
        log::debug!("{vat} exported {vref} as {kref}");
        Ok(kref)
    }

    /// Translate a vref the vat is *releasing*; it must already be mapped.
    pub(crate) fn lookup_vat_slot(&self, vat: VatId, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        self.clist_kref(vat, vref)?
            .ok_or_else(|| SyscallError::fatal(format!("{vat} referenced unmapped {vref}")))
    }

    /// Translate a kref being delivered into a vat, allocating an import
    /// when needed and marking the entry reachable.
    pub(crate) fn map_kernel_slot_to_vat(&mut self, vat: VatId, kref: KernelSlot) -> Result<VatSlot, KernelError> {
        if let Some(entry) = self.clist_entry(vat, kref)? {
            if !entry.reachable {
                self.set_reachable_flag(vat, kref)?;
            }
            return Ok(entry.vref);
        }
        if kref.is_object() && self.object_owner(kref)? == Some(vat) {
            return Err(KernelError::panic(format!(
                "{kref} is owned by {vat} but missing from its c-list"
            )));
        }
        let vref = self.allocate_import(vat, kref)?;
        self.add_clist_entry(vat, kref, vref, true)?;
        Ok(vref)
    }

    /// Move a terminated vat's c-list aside for inspection.
    pub(crate) fn freeze_clist(&mut self, vat: VatId, entries: &[(KernelSlot, ClistEntry)]) {
        for (kref, entry) in entries {
            self.set(format!("{vat}.frozen.{kref}"), entry.vref.to_string());
        }
    }
}

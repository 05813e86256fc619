#![no_main]

use libfuzzer_sys::fuzz_target;
use upkeep::journal;
use upkeep_store::{MemStore, Store};

// Journal load must never panic, whatever survived on disk: arbitrary
// bytes in either slot at worst produce a Corrupt/SchemaTooNew error.
fuzz_target!(|data: (&[u8], &[u8])| {
    let (committed, uncommitted) = data;
    let store = MemStore::new();
    if !committed.is_empty() {
        let _ = store.write(journal::KEY_STATE_DATA, committed);
    }
    if !uncommitted.is_empty() {
        let _ = store.write(journal::KEY_STATE_DATA_UNCOMMITTED, uncommitted);
    }
    let _ = journal::load(&store);
});

//! Starting a rendezvous from inside a rendezvous callback stops the machine.

mod common;

use common::{expect_fatal, spawn_kernel};
use kestrel_core::mp::hokusai;
use kestrel_hal::CpuId;

fn nested(_cpu: CpuId, arg: usize) {
    hokusai::synchronize(nested, arg);
}

#[test]
fn test_nested_rendezvous_is_fatal() {
    let _ = spawn_kernel("rendezvous", || hokusai::synchronize(nested, 0));

    let report = expect_fatal();
    assert!(report.contains("reentrant rendezvous"), "{report}");
}

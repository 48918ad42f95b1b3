/// This test should FAIL to compile
/// Running generated code before the window is executable, armed and silenced

use nix::unistd::Pid;
use opcodebox::counter::ExecutionCounter;
use opcodebox::exec::child::{ChildPlan, Fill, Sandbox};
use opcodebox::generator::SlotWidth;
use opcodebox::Method;
use std::time::Duration;

fn main() {
    let plan = ChildPlan {
        fill: Fill::Generate(Method::Random),
        counter: ExecutionCounter::new(SlotWidth::NATIVE, 0),
        rng_seed: 0,
        text: &[],
        page_size: 4096,
        watchdog: Duration::from_millis(50),
        parent: Pid::this(),
        detach: &[],
    };

    let sandbox = Sandbox::new(&plan)
        .detach()
        .unwrap()
        .harden()
        .unwrap()
        .contain_faults()
        .unwrap()
        .load()
        .unwrap();

    // Loaded has no execute(); only Silenced does
    sandbox.execute();
}

use anyhow::{ensure, Result};

use syncstore::protocol::ProtocolStack;
use syncstore::Synchronizer;

use crate::demo::demo_store;

// Move wire frames between the two synchronizers until quiescent.
fn pump(
    a: &mut Synchronizer,
    ca: syncstore::ConnectionId,
    b: &mut Synchronizer,
    cb: syncstore::ConnectionId,
) {
    loop {
        let ta = a.take_tx(ca);
        let tb = b.take_tx(cb);
        if ta.is_empty() && tb.is_empty() {
            return;
        }
        for f in ta {
            b.feed(cb, &f);
        }
        for f in tb {
            a.feed(ca, &f);
        }
    }
}

/// Two in-process stores of the same schema, replicated over a loopback.
pub fn sync_demo() -> Result<()> {
    let upstream = demo_store()?.into_handle();
    let mirror = demo_store()?.into_handle();

    let mut sync_a = Synchronizer::new();
    sync_a.map(&upstream);
    let conn_a = sync_a.connect(ProtocolStack::new());

    let mut sync_b = Synchronizer::new();
    sync_b.map(&mirror);
    let conn_b = sync_b.connect(ProtocolStack::new());

    // The mirror asks the upstream side for the initial content.
    sync_b.sync_from(&mirror, conn_b);
    pump(&mut sync_a, conn_a, &mut sync_b, conn_b);

    let counter = upstream
        .borrow()
        .variable::<u32>("/default uint32")
        .expect("demo schema");
    for round in 1..=5u32 {
        counter.set(&mut upstream.borrow_mut(), round * 11);
        sync_a.process();
        pump(&mut sync_a, conn_a, &mut sync_b, conn_b);

        let seen = counter.get(&mut mirror.borrow_mut());
        println!("round {round}: mirror sees {seen}");
        ensure!(seen == round * 11, "mirror out of sync");
    }

    println!("mirrors converged");
    Ok(())
}

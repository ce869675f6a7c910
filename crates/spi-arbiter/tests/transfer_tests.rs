mod common;

use std::sync::atomic::Ordering;

use common::*;
use embedded_hal::spi::{ErrorKind, MODE_0, MODE_3};
use spi_arbiter::{ArbiterError, Direction, TransferRequest};

#[futures_test::test]
async fn display_then_storage_share_one_bus() {
    let (arbiter, probe) = make_arbiter(4096);
    let display = display(&arbiter);
    let storage = storage(&arbiter);

    assert_eq!(arbiter.active_session(), None);
    let ticket = arbiter.acquire(&display, FOREVER).await.unwrap();
    let frame = [0x55u8; 512];
    let moved = arbiter
        .executor(&display)
        .transfer(&ticket, TransferRequest::Write(&frame))
        .await
        .unwrap();
    assert_eq!(moved, 512);
    arbiter.release(ticket).unwrap();

    assert_eq!(arbiter.active_session(), None);
    let ticket = arbiter.acquire(&storage, FOREVER).await.unwrap();
    let mut block = [0u8; 1024];
    let moved = arbiter
        .executor(&storage)
        .transfer(&ticket, TransferRequest::Read(&mut block))
        .await
        .unwrap();
    assert_eq!(moved, 1024);
    assert!(block.iter().all(|&b| b == 0xA5));
    arbiter.release(ticket).unwrap();

    assert!(!probe.contention.load(Ordering::SeqCst));
    assert_eq!(
        probe.ops(),
        vec![
            Op::Apply {
                chip_select: CS_DISPLAY,
                frequency: DISPLAY_HZ,
                mode: MODE_0
            },
            Op::Select(CS_DISPLAY),
            Op::Write(frame.to_vec()),
            Op::Flush,
            Op::Deselect(CS_DISPLAY),
            Op::Apply {
                chip_select: CS_STORAGE,
                frequency: STORAGE_HZ,
                mode: MODE_3
            },
            Op::Select(CS_STORAGE),
            Op::Read(1024),
            Op::Flush,
            Op::Deselect(CS_STORAGE),
        ]
    );
}

#[futures_test::test]
async fn oversized_request_touches_nothing() {
    let (arbiter, probe) = make_arbiter(4096);
    let storage = storage(&arbiter);
    let ticket = arbiter.acquire(&storage, FOREVER).await.unwrap();

    let big = vec![0u8; 4097];
    let result = arbiter
        .executor(&storage)
        .transfer(&ticket, TransferRequest::Write(&big))
        .await;
    assert_eq!(
        result,
        Err(ArbiterError::TransferSize { requested: 4097, max: 4096 })
    );
    assert!(probe.ops().is_empty());

    // Exactly the limit is fine.
    let moved = arbiter
        .executor(&storage)
        .transfer(&ticket, TransferRequest::Write(&big[..4096]))
        .await
        .unwrap();
    assert_eq!(moved, 4096);
    arbiter.release(ticket).unwrap();
}

#[futures_test::test]
async fn transfer_requires_live_ticket() {
    let (arbiter, probe) = make_arbiter(4096);
    let display = display(&arbiter);
    let storage = storage(&arbiter);
    let bytes = [1u8, 2, 3];

    let ticket = arbiter.acquire(&display, FOREVER).await.unwrap();
    arbiter.release(ticket).unwrap();
    let result = arbiter
        .executor(&display)
        .transfer(&ticket, TransferRequest::Write(&bytes))
        .await;
    assert_eq!(result, Err(ArbiterError::InvalidTicket));

    // A live ticket for another session does not open this executor.
    let ticket = arbiter.acquire(&display, FOREVER).await.unwrap();
    let result = arbiter
        .executor(&storage)
        .transfer(&ticket, TransferRequest::Write(&bytes))
        .await;
    assert_eq!(result, Err(ArbiterError::InvalidTicket));
    arbiter.release(ticket).unwrap();

    assert!(probe.ops().is_empty());
}

#[futures_test::test]
async fn transaction_keeps_chip_select_asserted() {
    let (arbiter, probe) = make_arbiter(4096);
    let storage = storage(&arbiter);
    let ticket = arbiter.acquire(&storage, FOREVER).await.unwrap();

    let command = [0x51, 0, 0, 0, 0, 0xFF];
    let mut response = [0u8; 8];
    let moved = arbiter
        .executor(&storage)
        .transaction(
            &ticket,
            &mut [
                TransferRequest::Write(&command),
                TransferRequest::Read(&mut response),
            ],
        )
        .await
        .unwrap();
    assert_eq!(moved, 14);
    arbiter.release(ticket).unwrap();

    let ops = probe.ops();
    assert_eq!(ops[1], Op::Select(CS_STORAGE));
    assert_eq!(ops[2], Op::Write(command.to_vec()));
    assert_eq!(ops[3], Op::Read(8));
    assert_eq!(ops[4], Op::Flush);
    assert_eq!(ops[5], Op::Deselect(CS_STORAGE));
    assert_eq!(ops.len(), 6);
}

#[futures_test::test]
async fn back_to_back_transfers_under_one_grant() {
    let (arbiter, probe) = make_arbiter(512);
    let storage = storage(&arbiter);
    let ticket = arbiter.acquire(&storage, FOREVER).await.unwrap();
    let executor = arbiter.executor(&storage);

    let mut sector = [0u8; 512];
    for _ in 0..4 {
        executor
            .transfer(&ticket, TransferRequest::Read(&mut sector))
            .await
            .unwrap();
    }
    arbiter.release(ticket).unwrap();

    let selects = probe
        .ops()
        .iter()
        .filter(|op| matches!(op, Op::Select(_)))
        .count();
    assert_eq!(selects, 4);
    assert_eq!(arbiter.stats().grants, 1);
}

#[futures_test::test]
async fn full_duplex_length_is_the_longer_buffer() {
    let (arbiter, probe) = make_arbiter(16);
    let display = display(&arbiter);
    let ticket = arbiter.acquire(&display, FOREVER).await.unwrap();

    let write = [0xAAu8; 4];
    let mut read = [0u8; 10];
    let request = TransferRequest::FullDuplex { read: &mut read, write: &write };
    assert_eq!(request.direction(), Direction::FullDuplex);
    assert_eq!(request.len(), 10);

    let moved = arbiter
        .executor(&display)
        .transfer(&ticket, request)
        .await
        .unwrap();
    assert_eq!(moved, 10);
    assert_eq!(&read[..4], &write);

    let mut echo = [7u8; 3];
    let moved = arbiter
        .executor(&display)
        .transfer(&ticket, TransferRequest::InPlace(&mut echo))
        .await
        .unwrap();
    assert_eq!(moved, 3);
    assert_eq!(echo, [7, 7, 7]);
    arbiter.release(ticket).unwrap();

    assert!(probe.ops().contains(&Op::Transfer { read: 10, write: 4 }));
    assert!(probe.ops().contains(&Op::TransferInPlace(3)));
}

#[futures_test::test]
async fn port_error_is_reported_and_chip_select_released() {
    let (arbiter, probe) = make_arbiter(4096);
    let storage = storage(&arbiter);
    let ticket = arbiter.acquire(&storage, FOREVER).await.unwrap();

    probe.fail_io.store(true, Ordering::SeqCst);
    let result = arbiter
        .executor(&storage)
        .transfer(&ticket, TransferRequest::Write(&[0xFF; 10]))
        .await;
    assert_eq!(result, Err(ArbiterError::Bus(ErrorKind::Other)));
    assert_eq!(probe.selected.load(Ordering::SeqCst), 0);
    assert_eq!(probe.ops().last(), Some(&Op::Deselect(CS_STORAGE)));

    // The grant survives; the caller decides whether to retry.
    assert_eq!(arbiter.active_session(), Some(storage.id()));
    arbiter.release(ticket).unwrap();
}

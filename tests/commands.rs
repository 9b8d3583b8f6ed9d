mod common;

use common::*;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tuyable::command::{DP_SWITCH, DpType, dp_payload, on_off_payload, play_payload};
use tuyable::{
    CommandCode, ConnectionConfig, SmartDotController, SmartDotProgram, TuyaCommandContext,
    TuyaError,
};

async fn paired(behavior: Behavior, config: ConnectionConfig) -> (FakeDevice, SmartDotController<FakeDevice>) {
    let device = FakeDevice::new(behavior);
    let conn = connection(&device, config);
    conn.connect(&CancellationToken::new()).await.unwrap();
    (device, SmartDotController::new(conn))
}

fn commands(device: &FakeDevice) -> Vec<Vec<u8>> {
    device
        .requests_with(CommandCode::FUN_SENDER_DPS_V4)
        .into_iter()
        .map(|r| r.msg.payload)
        .collect()
}

#[tokio::test]
async fn on_and_off_are_acknowledged() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let cancel = CancellationToken::new();

    assert_eq!(dot.on(&cancel).await, Ok(true));
    assert_eq!(dot.off(&cancel).await, Ok(true));

    // Command numbers start at one after connecting
    assert_eq!(
        commands(&device),
        vec![on_off_payload(1, true), on_off_payload(2, false)]
    );
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn play_sends_program_number() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let program = SmartDotProgram::new(0x0000_0102);

    assert_eq!(dot.play(program, &CancellationToken::new()).await, Ok(true));
    let sent = commands(&device);
    assert_eq!(sent, vec![play_payload(1, program)]);
    assert_eq!(&sent[0][9..13], &[0x00, 0x00, 0x01, 0x02]);
}

#[tokio::test]
async fn mismatched_echo_is_a_failed_command() {
    let (_device, dot) = paired(
        Behavior {
            wrong_echo: true,
            ..Behavior::default()
        },
        test_config(),
    )
    .await;

    assert_eq!(dot.on(&CancellationToken::new()).await, Ok(false));
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn unanswered_command_times_out() {
    let config = ConnectionConfig {
        command_timeout_ms: Some(100),
        ..test_config()
    };
    let (_device, dot) = paired(
        Behavior {
            ack_commands: false,
            ..Behavior::default()
        },
        config,
    )
    .await;

    assert_eq!(dot.on(&CancellationToken::new()).await, Err(TuyaError::Timeout));
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn cancelled_command_fails() {
    let config = ConnectionConfig {
        command_timeout_ms: None,
        ..test_config()
    };
    let (_device, dot) = paired(
        Behavior {
            ack_commands: false,
            ..Behavior::default()
        },
        config,
    )
    .await;
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    assert_eq!(dot.off(&cancel).await, Err(TuyaError::Cancelled));
    canceller.await.unwrap();
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn abandoned_commands_leave_no_pending_entries() {
    let config = ConnectionConfig {
        command_timeout_ms: None,
        ..test_config()
    };
    let (device, dot) = paired(
        Behavior {
            ack_commands: false,
            ..Behavior::default()
        },
        config,
    )
    .await;
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        assert!(timeout(Duration::from_millis(20), dot.on(&cancel)).await.is_err());
    }
    assert_eq!(commands(&device).len(), 5);
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn link_loss_fails_pending_command() {
    let config = ConnectionConfig {
        command_timeout_ms: None,
        ..test_config()
    };
    let (device, dot) = paired(
        Behavior {
            ack_commands: false,
            ..Behavior::default()
        },
        config,
    )
    .await;

    let pending = {
        let dot = dot.clone();
        tokio::spawn(async move { dot.on(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.drop_link();

    let res = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert!(matches!(res, Err(TuyaError::TransportUnavailable(_))), "{:?}", res);
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn command_before_connect_is_rejected() {
    let device = FakeDevice::new(Behavior::default());
    let dot = SmartDotController::new(connection(&device, test_config()));

    let err = dot.on(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TuyaError::TransportUnavailable(_)), "{:?}", err);
    assert!(device.received().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_complete_out_of_order() {
    let (device, dot) = paired(
        Behavior {
            hold_acks: 4,
            ..Behavior::default()
        },
        test_config(),
    )
    .await;

    let tasks: Vec<_> = (0..4u32)
        .map(|i| {
            let dot = dot.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                if i % 2 == 0 {
                    dot.on(&cancel).await
                } else {
                    dot.play(SmartDotProgram::new(i), &cancel).await
                }
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(true));
    }

    let mut numbers: Vec<u32> = commands(&device)
        .iter()
        .map(|p| u32::from_be_bytes(p[1..5].try_into().unwrap()))
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(dot.connection().pending_requests(), 0);
}

#[tokio::test]
async fn custom_data_point_command() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let conn = dot.connection();

    let command_num = conn.next_command_number().unwrap();
    let payload = dp_payload(command_num, DP_SWITCH, DpType::Bool, &[1]).unwrap();
    let ok = conn
        .execute_command_with_response(
            CommandCode::FUN_SENDER_DPS_V4,
            payload.clone(),
            TuyaCommandContext::new(command_num),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(ok, Ok(true));
    assert_eq!(commands(&device), vec![payload]);
}

#[tokio::test]
async fn unsolicited_notifications_reach_stream() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let mut events = Box::pin(dot.connection().stream());

    device.push_unsolicited(CommandCode::FUN_RECEIVE_DP_V4, vec![0x69, 0x01, 0x00, 0x01, 0x00]);

    let msg = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.code, CommandCode::FUN_RECEIVE_DP_V4);
    assert_eq!(msg.response_to, 0);
    assert_eq!(msg.payload, vec![0x69, 0x01, 0x00, 0x01, 0x00]);
}

#[tokio::test]
async fn late_responses_are_published_as_unmatched() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let mut events = Box::pin(dot.connection().stream());

    device.send_raw(device.frame(999, CommandCode::FUN_SENDER_DPS_V4, vec![0, 0, 0, 0, 9]));

    let msg = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.response_to, 999);
}

#[tokio::test]
async fn corrupt_notifications_are_dropped() {
    let (device, dot) = paired(Behavior::default(), test_config()).await;
    let mut events = Box::pin(dot.connection().stream());

    // Too short to hold IV and one block
    device.send_raw(vec![0x00, 0x05, 0x20, 0x05, 0x01, 0x02, 0x03, 0x04]);
    // Truncated frame
    let mut truncated = device.frame(0, CommandCode::FUN_RECEIVE_DP_V4, vec![1, 2, 3]);
    truncated.pop();
    device.send_raw(truncated);
    // Unknown security flag
    let mut flagged = device.frame(0, CommandCode::FUN_RECEIVE_DP_V4, vec![1, 2, 3]);
    flagged[3] = 0x07;
    device.send_raw(flagged);

    // The reader keeps going
    assert_eq!(dot.on(&CancellationToken::new()).await, Ok(true));
    device.push_unsolicited(CommandCode::FUN_RECEIVE_DP_V4, vec![7]);
    let msg = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, vec![7]);
}

#[tokio::test]
async fn disposed_controller_fails_fast() {
    let (_device, dot) = paired(Behavior::default(), test_config()).await;
    dot.connection().dispose().await;

    assert_eq!(dot.on(&CancellationToken::new()).await, Err(TuyaError::Disposed));
}

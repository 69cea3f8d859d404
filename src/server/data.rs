// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The object-blast dispatcher.
//!
//! The client calls `get_object` in a loop; each call blocks until a
//! passing object is available and returns it with its attributes. When
//! the search finishes, the pump enqueues an end-of-search marker (empty
//! object id) which is delivered like any other result; further calls
//! keep receiving the marker.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    proto::{Opcode, Status, read_frame, write_frame},
    server::search::SearchShared,
};

pub async fn serve_data(
    mut stream: TcpStream,
    shared: Arc<SearchShared>,
    cancel: CancellationToken,
) {
    let mut finished = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(f) => f,
                Err(e) => {
                    debug!("data connection closed: {e:#}");
                    break;
                },
            },
        };

        if !matches!(Opcode::try_from(frame.opcode), Ok(Opcode::GetObject)) {
            let failed = write_frame(
                &mut stream,
                frame.opcode,
                frame.sequence,
                Status::ProcedureUnavailable,
                &[],
            )
            .await
            .is_err();
            if failed {
                break;
            }
            continue;
        }

        let next = if finished {
            None
        } else {
            let mut rx = shared.blast_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                obj = rx.recv() => obj,
            }
        };

        let payload = match next {
            Some(obj) => {
                if obj.object_id.is_empty() {
                    finished = true;
                }
                serde_json::to_vec(&obj).unwrap_or_default()
            },
            None => {
                // Queue closed or already finished: repeat the marker.
                finished = true;
                serde_json::to_vec(&crate::proto::blast::BlastObject {
                    object_id: String::new(),
                    body: None,
                    attrs: Vec::new(),
                })
                .unwrap_or_default()
            },
        };

        if let Err(e) =
            write_frame(&mut stream, frame.opcode, frame.sequence, Status::Ok, &payload).await
        {
            warn!("blast reply failed: {e:#}");
            break;
        }
    }
}

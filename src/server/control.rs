// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The control-channel dispatcher: one task per connection, one search
//! per connection. Requests are served strictly in arrival order; every
//! reply echoes the request's sequence number. Error policy follows the
//! channel's taxonomy: undecodable payloads answer `encoding-error`,
//! unknown opcodes answer `procedure-unavailable`, and only broken
//! framing drops the connection.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Serialize, de::DeserializeOwned};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    proto::{
        Frame, Opcode, Status, read_frame, write_frame,
        control::{
            Empty, NamedAttr, ReexecuteRequest, ReexecuteResponse, SendObjRequest,
            SessionVarsResponse, SessionVarsSetRequest, SetBlobBySignatureRequest,
            SetBlobRequest, SetObjRequest, SetPushAttrsRequest, SetScopeRequest,
            SetSpecRequest, StartRequest,
        },
    },
    server::search::{Search, SearchError},
};

fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, Status> {
    serde_json::from_slice(&frame.payload).map_err(|_| Status::EncodingError)
}

fn encode<T: Serialize>(body: &T) -> Vec<u8> {
    serde_json::to_vec(body).unwrap_or_default()
}

fn status_of(err: &SearchError) -> Status {
    match err {
        SearchError::CookieExpired => Status::CookieExpired,
        SearchError::KeyRejected => Status::KeyRejected,
        SearchError::CacheMiss => Status::CacheMiss,
        SearchError::Other(_) => Status::ServerFailure,
    }
}

/// Serve one control connection until EOF or a framing error.
pub async fn serve_control(
    mut stream: TcpStream,
    mut search: Search,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(f) => f,
                Err(e) => {
                    debug!("control connection closed: {e:#}");
                    break;
                },
            },
        };

        let (status, payload) = dispatch(&mut search, &frame).await;
        if let Err(e) =
            write_frame(&mut stream, frame.opcode, frame.sequence, status, &payload).await
        {
            warn!("control reply failed: {e:#}");
            break;
        }
    }
    search.close().await;
    info!("control connection torn down");
}

async fn dispatch(search: &mut Search, frame: &Frame) -> (Status, Vec<u8>) {
    let Ok(opcode) = Opcode::try_from(frame.opcode) else {
        return (Status::ProcedureUnavailable, Vec::new());
    };

    match opcode {
        Opcode::Start => {
            let req: StartRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.start(&req.search_id).await)
        },
        Opcode::Stop => {
            search.stop();
            (Status::Ok, encode(&Empty {}))
        },
        Opcode::SetScope => {
            let req: SetScopeRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.set_scope(&req.cookie))
        },
        Opcode::SetSpec => {
            let req: SetSpecRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.set_spec(&req.data, req.sig).await)
        },
        Opcode::SetPushAttrs => {
            let req: SetPushAttrsRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            search.set_push_attrs(req.names);
            (Status::Ok, encode(&Empty {}))
        },
        Opcode::SetBlob => {
            let req: SetBlobRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.set_blob(&req.filter_name, &req.data))
        },
        Opcode::SetBlobBySignature => {
            let req: SetBlobBySignatureRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.set_blob_by_signature(&req.filter_name, req.sig))
        },
        Opcode::SetObj => {
            let req: SetObjRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.set_obj(req.sig))
        },
        Opcode::SendObj => {
            let req: SendObjRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            reply_empty(search.send_obj(req.sig, &req.data))
        },
        Opcode::ReexecuteFilters => {
            let req: ReexecuteRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            match search.reexecute(&req.object_id, &req.attr_names).await {
                Ok(attrs) => {
                    let resp = ReexecuteResponse {
                        attrs: attrs
                            .into_iter()
                            .map(|(name, data)| NamedAttr { name, data })
                            .collect(),
                    };
                    (Status::Ok, encode(&resp))
                },
                Err(e) => {
                    warn!("reexecute failed: {e:#}");
                    (Status::ServerFailure, Vec::new())
                },
            }
        },
        Opcode::RequestStats => match search.stats().await {
            Ok(stats) => (Status::Ok, encode(&stats)),
            Err(e) => {
                debug!("stats unavailable: {e:#}");
                (Status::ServerFailure, Vec::new())
            },
        },
        Opcode::SessionVarsGet => {
            let resp = SessionVarsResponse {
                vars: search.session().snapshot(),
            };
            (Status::Ok, encode(&resp))
        },
        Opcode::SessionVarsSet => {
            let req: SessionVarsSetRequest = match decode(frame) {
                Ok(r) => r,
                Err(s) => return (s, Vec::new()),
            };
            let vars: HashMap<String, f64> = req.vars;
            search.session().replace(vars);
            (Status::Ok, encode(&Empty {}))
        },
        Opcode::GetObject => {
            // Blast-channel opcode on the control socket.
            (Status::ProcedureUnavailable, Vec::new())
        },
    }
}

fn reply_empty(result: Result<(), SearchError>) -> (Status, Vec<u8>) {
    match result {
        Ok(()) => (Status::Ok, encode(&Empty {})),
        Err(e) => {
            debug!("request refused: {e}");
            (status_of(&e), Vec::new())
        },
    }
}

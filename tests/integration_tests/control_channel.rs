// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use diamondd::{
    proto::{
        Opcode, Status,
        control::{Empty, SetScopeRequest, SetSpecRequest, StartRequest},
    },
    sig::Signature,
};
use serial_test::serial;

use super::common::{call, connect_control, reply_status, spawn_server};

const SPEC: &str = "FILTER f_pass\nTHRESHOLD 1\nEVAL_FUNCTION e\nINIT_FUNCTION i\nFINI_FUNCTION f\n";

fn expired_cookie() -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    let payload = format!(
        "deadbeef\nVersion: 1\nSerial: s\nKeyId: k\nExpires: 2001-01-01T00:00:00+00:00\nServers: {}\n\nhttp://127.0.0.1:9/scope\n",
        super::common::TEST_SERVER_NAME
    );
    format!(
        "-----BEGIN OPENDIAMOND SCOPECOOKIE-----\n{}\n-----END OPENDIAMOND SCOPECOOKIE-----\n",
        STANDARD.encode(payload)
    )
}

fn foreign_cookie() -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    let payload = "deadbeef\nVersion: 1\nSerial: s\nKeyId: k\nExpires: 2999-01-01T00:00:00+00:00\nServers: elsewhere.example\n\nhttp://127.0.0.1:9/scope\n";
    format!(
        "-----BEGIN OPENDIAMOND SCOPECOOKIE-----\n{}\n-----END OPENDIAMOND SCOPECOOKIE-----\n",
        STANDARD.encode(payload)
    )
}

#[tokio::test]
#[serial]
async fn test_unknown_opcode_answers_procedure_unavailable() -> Result<()> {
    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    let reply = call(&mut control, 0xff, 1, &Empty {}).await?;
    assert_eq!(reply_status(&reply), Status::ProcedureUnavailable);

    // The connection survives and serves the next request.
    let reply = call(&mut control, Opcode::Stop as u32, 2, &Empty {}).await?;
    assert_eq!(reply_status(&reply), Status::Ok);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_undecodable_payload_answers_encoding_error() -> Result<()> {
    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    // Start expects a search_id; hand it an empty object instead.
    let reply = call(&mut control, Opcode::Start as u32, 1, &Empty {}).await?;
    assert_eq!(reply_status(&reply), Status::EncodingError);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_scope_cookie_gates() -> Result<()> {
    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    let reply = call(
        &mut control,
        Opcode::SetScope as u32,
        1,
        &SetScopeRequest {
            cookie: expired_cookie(),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::CookieExpired);

    let reply = call(
        &mut control,
        Opcode::SetScope as u32,
        2,
        &SetScopeRequest {
            cookie: foreign_cookie(),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::KeyRejected);

    // With no valid scope installed, start is refused.
    let reply = call(
        &mut control,
        Opcode::Start as u32,
        3,
        &StartRequest {
            search_id: "s-1".to_string(),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::ServerFailure);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_set_spec_validates_signature() -> Result<()> {
    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    // Correct signature installs.
    let reply = call(
        &mut control,
        Opcode::SetSpec as u32,
        1,
        &SetSpecRequest {
            data: SPEC.as_bytes().to_vec(),
            sig: Signature::of_bytes(SPEC.as_bytes()),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::Ok);

    // A lying signature is refused.
    let reply = call(
        &mut control,
        Opcode::SetSpec as u32,
        2,
        &SetSpecRequest {
            data: SPEC.as_bytes().to_vec(),
            sig: Signature::of_bytes(b"something else"),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::ServerFailure);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_blob_by_signature_misses_when_unknown() -> Result<()> {
    use diamondd::proto::control::SetBlobBySignatureRequest;

    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    // Install a spec so the filter name resolves; the blob is unknown.
    let reply = call(
        &mut control,
        Opcode::SetSpec as u32,
        1,
        &SetSpecRequest {
            data: SPEC.as_bytes().to_vec(),
            sig: Signature::of_bytes(SPEC.as_bytes()),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::Ok);

    let reply = call(
        &mut control,
        Opcode::SetBlobBySignature as u32,
        2,
        &SetBlobBySignatureRequest {
            filter_name: "f_pass".to_string(),
            sig: Signature::of_bytes(b"never stored"),
        },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::CacheMiss);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_session_variables_round_trip() -> Result<()> {
    use std::collections::HashMap;

    use diamondd::proto::control::{SessionVarsResponse, SessionVarsSetRequest};

    use super::common::decode_reply;

    let server = spawn_server().await?;
    let (mut control, _nonce) = connect_control(&server).await?;

    let mut vars = HashMap::new();
    vars.insert("anomaly.mean".to_string(), 0.25);
    vars.insert("anomaly.count".to_string(), 17.0);

    let reply = call(
        &mut control,
        Opcode::SessionVarsSet as u32,
        1,
        &SessionVarsSetRequest { vars: vars.clone() },
    )
    .await?;
    assert_eq!(reply_status(&reply), Status::Ok);

    let reply = call(&mut control, Opcode::SessionVarsGet as u32, 2, &()).await?;
    assert_eq!(reply_status(&reply), Status::Ok);
    let got: SessionVarsResponse = decode_reply(&reply)?;
    assert_eq!(got.vars, vars);
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Cursor;

use anyhow::Result;
use diamondd::runner::framing::{
    BlockingFrameReader, BlockingFrameWriter, FrameReader, FrameWriter,
};

fn written(build: impl FnOnce(&mut BlockingFrameWriter<&mut Vec<u8>>) -> Result<()>) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = BlockingFrameWriter::new(&mut buf);
    build(&mut writer).expect("write frames");
    buf
}

#[test]
fn test_string_round_trip() -> Result<()> {
    let buf = written(|w| {
        w.write_string("hello")?;
        w.write_string("")?;
        w.write_none()
    });
    assert_eq!(buf, b"5\nhello\n0\n\n\n");

    let mut reader = BlockingFrameReader::new(Cursor::new(buf));
    assert_eq!(reader.read_string()?, Some("hello".to_string()));
    assert_eq!(reader.read_string()?, Some(String::new()));
    assert_eq!(reader.read_string()?, None);
    Ok(())
}

#[test]
fn test_binary_round_trip() -> Result<()> {
    let payload = [0u8, 10, b'\n', 255, 42];
    let buf = written(|w| w.write_binary(&payload));

    let mut reader = BlockingFrameReader::new(Cursor::new(buf));
    assert_eq!(reader.read_binary()?.as_deref(), Some(&payload[..]));
    Ok(())
}

#[test]
fn test_int_and_double_round_trip() -> Result<()> {
    let buf = written(|w| {
        w.write_int(-17)?;
        w.write_double(0.30000000000000004)?;
        w.write_double(1.0)
    });

    let mut reader = BlockingFrameReader::new(Cursor::new(buf));
    assert_eq!(reader.read_string()?, Some("-17".to_string()));
    // Doubles render as the shortest decimal that parses back losslessly.
    assert_eq!(reader.read_double()?, 0.30000000000000004);
    assert_eq!(reader.read_double()?, 1.0);
    Ok(())
}

#[test]
fn test_string_list_blank_terminated() -> Result<()> {
    let items = vec!["one".to_string(), "two".to_string(), "three".to_string()];
    let buf = written(|w| {
        for item in &items {
            w.write_string(item)?;
        }
        w.write_none()
    });

    let mut reader = BlockingFrameReader::new(Cursor::new(buf));
    assert_eq!(reader.read_string_list()?, items);
    Ok(())
}

#[test]
fn test_tag_lines() -> Result<()> {
    let buf = written(|w| {
        w.write_tag("functions-resolved")?;
        w.write_tag("init-success")
    });

    let mut reader = BlockingFrameReader::new(Cursor::new(buf));
    assert_eq!(reader.read_tag()?, "functions-resolved");
    assert_eq!(reader.read_tag()?, "init-success");
    Ok(())
}

#[test]
fn test_desync_is_an_error() {
    // Length line claims five bytes but the pipe ends early.
    let mut reader = BlockingFrameReader::new(Cursor::new(b"5\nhi\n".to_vec()));
    assert!(reader.read_binary().is_err());

    // Garbage length line.
    let mut reader = BlockingFrameReader::new(Cursor::new(b"nonsense\nx\n".to_vec()));
    assert!(reader.read_binary().is_err());
}

#[tokio::test]
async fn test_async_framing_matches_blocking() -> Result<()> {
    let buf = written(|w| {
        w.write_tag("result")?;
        w.write_double(2.5)?;
        w.write_string("done")
    });

    let mut reader = FrameReader::new(Cursor::new(buf.clone()));
    assert_eq!(reader.read_tag().await?, "result");
    assert_eq!(reader.read_double().await?, 2.5);
    assert_eq!(reader.read_string().await?, Some("done".to_string()));

    // And the async writer produces identical bytes.
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = FrameWriter::new(&mut out);
        writer.write_tag("result").await?;
        writer.write_double(2.5).await?;
        writer.write_string("done").await?;
    }
    assert_eq!(out.into_inner(), buf);
    Ok(())
}

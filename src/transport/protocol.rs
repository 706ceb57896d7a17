//! Wire format of the realtime detection channel.
//!
//! Client sends: `{ "frame": "data:image/jpeg;base64,..." }`
//! Server sends either
//! `{ "detections": [...], "total_weapons": n, "processing_time": secs }`
//! (optionally with `fps` and `frame_count`) or `{ "error": "..." }`.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::detect::BoundingBox;
use crate::error::PipelineError;
use crate::geometry::Rect;

/// Outbound frame message.
#[derive(Debug, Serialize)]
pub struct FrameMessage<'a> {
    pub frame: &'a str,
}

/// Inbound message as it appears on the wire.
#[derive(Debug, Deserialize)]
pub struct ReplyWire {
    #[serde(default)]
    pub detections: Vec<DetectionWire>,
    #[serde(default)]
    pub total_weapons: Option<u32>,
    /// Server-side inference time in seconds.
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default)]
    pub frame_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DetectionWire {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoxWire,
}

#[derive(Debug, Deserialize)]
pub struct BoxWire {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Parsed detection reply.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionReply {
    pub boxes: Vec<BoundingBox>,
    pub total_weapons: u32,
    pub processing_time_s: f64,
    pub server_fps: Option<f32>,
    pub frame_count: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Detections(DetectionReply),
    /// The server could not process the frame; the stream itself is fine.
    Error(String),
}

/// Parse an inbound text message.
///
/// An `error` field wins over any detection fields sent alongside it, even
/// malformed ones.
pub fn parse_reply(text: &str) -> Result<Reply, PipelineError> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| PipelineError::ParseError(e.to_string()))?;

    match value.get_mut("error").map(serde_json::Value::take) {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::String(error)) => return Ok(Reply::Error(error)),
        Some(other) => return Ok(Reply::Error(other.to_string())),
    }

    let wire: ReplyWire =
        serde_json::from_value(value).map_err(|e| PipelineError::ParseError(e.to_string()))?;

    let boxes: Vec<BoundingBox> = wire
        .detections
        .into_iter()
        .map(|d| {
            BoundingBox::new(
                d.class_name,
                d.confidence,
                (d.bbox.x1, d.bbox.y1),
                (d.bbox.x2, d.bbox.y2),
            )
        })
        .collect();
    let processing_time_s = wire.processing_time.unwrap_or(0.0);
    if !processing_time_s.is_finite() || processing_time_s < 0.0 {
        return Err(PipelineError::ParseError(format!(
            "invalid processing_time {}",
            processing_time_s
        )));
    }

    Ok(Reply::Detections(DetectionReply {
        total_weapons: wire.total_weapons.unwrap_or(boxes.len() as u32),
        boxes,
        processing_time_s,
        server_fps: wire.fps,
        frame_count: wire.frame_count,
    }))
}

pub fn encode_frame_message(data_uri: &str) -> String {
    // Serializing a struct holding one &str cannot fail.
    serde_json::to_string(&FrameMessage { frame: data_uri })
        .unwrap_or_else(|_| String::from("{}"))
}

/// Encode a rectangle as the `x,y,width,height` integer descriptor.
pub fn roi_descriptor(rect: &Rect) -> String {
    format!(
        "{},{},{},{}",
        rect.x.round() as i64,
        rect.y.round() as i64,
        rect.width.round() as i64,
        rect.height.round() as i64
    )
}

/// Parameters fixed for the lifetime of one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectParams {
    pub endpoint: Url,
    pub confidence: f32,
    pub model: String,
    /// Restricted zone in the encoded frame space, sent once at connect time.
    pub roi: Option<Rect>,
    pub token: Option<String>,
}

impl ConnectParams {
    /// Endpoint URL with the connection parameters as query arguments.
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("confidence", &self.confidence.to_string());
            query.append_pair("model_type", &self.model);
            if let Some(roi) = &self.roi {
                query.append_pair("roi", &roi_descriptor(roi));
            }
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        url
    }
}

use base64::prelude::*;
use qrcode::render::svg;
use qrcode::QrCode;

#[derive(Debug, thiserror::Error)]
#[error("failed to render pairing code: {0}")]
pub struct RenderError(pub String);

/// A pairing token together with its display encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingArtifact {
    pub token: String,
    pub encoded: String,
}

/// Turns a raw pairing token into something a human can scan.
pub trait PairingRenderer: Send + Sync {
    fn render(&self, token: &str) -> Result<String, RenderError>;
}

/// Renders the token as a QR code SVG wrapped in a `data:` URL.
#[derive(Clone, Copy, Debug)]
pub struct QrSvgRenderer {
    pub min_size: u32,
}

impl Default for QrSvgRenderer {
    fn default() -> Self {
        Self { min_size: 256 }
    }
}

impl PairingRenderer for QrSvgRenderer {
    fn render(&self, token: &str) -> Result<String, RenderError> {
        let code = QrCode::new(token.as_bytes()).map_err(|e| RenderError(e.to_string()))?;
        let image = code
            .render::<svg::Color>()
            .min_dimensions(self.min_size, self.min_size)
            .build();
        Ok(format!("data:image/svg+xml;base64,{}", BASE64_STANDARD.encode(image)))
    }
}

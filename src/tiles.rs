//! Tile request descriptors.
//!
//! A tile addresses a rectangular raster of a document region: a part
//! index, the output size in pixels, and the region in twips. A combined
//! request shares the sizes and carries one position per sub-tile.

use crate::error::{KitError, Result};
use crate::protocol::{get_token_int, get_token_int_list};

/// Axis-aligned rectangle in twips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self { left, top, width, height }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    /// Grow this rectangle to cover `other` as well.
    pub fn extend(&mut self, other: &Rect) {
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        self.left = self.left.min(other.left);
        self.top = self.top.min(other.top);
        self.width = right - self.left;
        self.height = bottom - self.top;
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right()
            && other.left < self.right()
            && self.top < other.bottom()
            && other.top < self.bottom()
    }
}

/// A single tile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
    pub version: i32,
    pub id: Option<i32>,
    /// Byte length of the encoded image, filled in by the renderer.
    pub img_size: usize,
}

impl TileDesc {
    /// Parse a `tile` command from its tokens (the command token included).
    pub fn parse(tokens: &[&str]) -> Result<Self> {
        let field = |name: &str| -> Result<i32> {
            get_token_int(tokens, name)
                .ok_or_else(|| KitError::Protocol(format!("tile request missing '{name}='")))
        };

        let desc = Self {
            part: field("part")?,
            width: field("width")?,
            height: field("height")?,
            tile_pos_x: field("tileposx")?,
            tile_pos_y: field("tileposy")?,
            tile_width: field("tilewidth")?,
            tile_height: field("tileheight")?,
            version: field("ver")?,
            id: get_token_int(tokens, "id"),
            img_size: 0,
        };
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<()> {
        if self.part < 0
            || self.width <= 0
            || self.height <= 0
            || self.tile_pos_x < 0
            || self.tile_pos_y < 0
            || self.tile_width <= 0
            || self.tile_height <= 0
        {
            return Err(KitError::Protocol(format!(
                "invalid tile geometry: part={} {}x{}px at ({}, {}) {}x{}twips",
                self.part,
                self.width,
                self.height,
                self.tile_pos_x,
                self.tile_pos_y,
                self.tile_width,
                self.tile_height
            )));
        }
        Ok(())
    }

    /// Region of the document this tile covers, in twips.
    pub fn rect(&self) -> Rect {
        Rect::new(self.tile_pos_x, self.tile_pos_y, self.tile_width, self.tile_height)
    }

    /// Serialize with a command prefix, echoing all given fields back.
    pub fn serialize(&self, prefix: &str) -> String {
        let mut out = format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={} tilewidth={} tileheight={} ver={}",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height,
            self.version
        );
        if let Some(id) = self.id {
            out.push_str(&format!(" id={id}"));
        }
        out
    }
}

/// A combined multi-tile request: shared geometry plus one position per tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCombined {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_width: i32,
    pub tile_height: i32,
    pub version: i32,
    pub tiles: Vec<TileDesc>,
}

impl TileCombined {
    /// Parse a `tilecombine` command from its tokens.
    pub fn parse(tokens: &[&str]) -> Result<Self> {
        let field = |name: &str| -> Result<i32> {
            get_token_int(tokens, name)
                .ok_or_else(|| KitError::Protocol(format!("tilecombine missing '{name}='")))
        };
        let list = |name: &str| -> Result<Vec<i32>> {
            get_token_int_list(tokens, name)
                .ok_or_else(|| KitError::Protocol(format!("tilecombine missing '{name}='")))
        };

        let part = field("part")?;
        let width = field("width")?;
        let height = field("height")?;
        let tile_width = field("tilewidth")?;
        let tile_height = field("tileheight")?;
        let version = field("ver")?;
        let xs = list("tileposx")?;
        let ys = list("tileposy")?;

        if xs.is_empty() || xs.len() != ys.len() {
            return Err(KitError::Protocol(format!(
                "tilecombine position arity mismatch: {} x, {} y",
                xs.len(),
                ys.len()
            )));
        }

        let tiles = xs
            .into_iter()
            .zip(ys)
            .map(|(x, y)| {
                let desc = TileDesc {
                    part,
                    width,
                    height,
                    tile_pos_x: x,
                    tile_pos_y: y,
                    tile_width,
                    tile_height,
                    version,
                    id: None,
                    img_size: 0,
                };
                desc.validate()?;
                Ok(desc)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { part, width, height, tile_width, tile_height, version, tiles })
    }

    /// Minimal bounding rectangle over all requested positions, in twips.
    pub fn render_area(&self) -> Rect {
        let mut area = self.tiles[0].rect();
        for tile in &self.tiles[1..] {
            area.extend(&tile.rect());
        }
        area
    }

    /// Serialize with a command prefix; `imgsize` carries the per-tile
    /// encoded byte lengths recorded by the renderer.
    pub fn serialize(&self, prefix: &str) -> String {
        let join = |f: fn(&TileDesc) -> String| -> String {
            self.tiles.iter().map(f).collect::<Vec<_>>().join(",")
        };
        format!(
            "{prefix} part={} width={} height={} tileposx={} tileposy={} imgsize={} tilewidth={} tileheight={} ver={}",
            self.part,
            self.width,
            self.height,
            join(|t| t.tile_pos_x.to_string()),
            join(|t| t.tile_pos_y.to_string()),
            join(|t| t.img_size.to_string()),
            self.tile_width,
            self.tile_height,
            self.version
        )
    }
}

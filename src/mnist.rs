use crate::dataset::Dataset;
use crate::error::DatasetError;
use flate2::read::GzDecoder;
use itertools::Itertools;
use log::info;
use ndarray::Array2;
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};

pub const IMAGE_SIDE: usize = 28;
pub const PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const DIGITS: usize = 10;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

fn open(path: &Path) -> Result<File, DatasetError> {
    File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// Read a Kaggle-style digit CSV: a header line, then one `label,pixel0,...,pixel783` row per image.
// Pixel intensities are returned as they appear in the file, unscaled.
pub fn load_csv(path: &Path) -> Result<Dataset, DatasetError> {
    let parse_error = |line: usize, message: String| DatasetError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let reader = BufReader::new(open(path)?);
    let mut labels = Vec::new();
    let mut pixels = Vec::new();

    // Line numbers are 1-based and count the header.
    for (number, line) in reader.lines().enumerate().skip(1) {
        let number = number + 1;
        let line = line.map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split(',');
        let label = fields
            .next()
            .unwrap_or_default()
            .trim()
            .parse::<usize>()
            .map_err(|err| parse_error(number, format!("bad label: {err}")))?;
        if label >= DIGITS {
            return Err(parse_error(number, format!("label {label} is not a digit")));
        }

        let start = pixels.len();
        for field in fields {
            let value = field
                .trim()
                .parse::<f64>()
                .map_err(|err| {
                    parse_error(number, format!("bad pixel {:?}: {err}", field.trim()))
                })?;
            pixels.push(value);
        }
        let found = pixels.len() - start;
        if found != PIXELS {
            return Err(parse_error(number, format!("expected {PIXELS} pixels, found {found}")));
        }
        labels.push(label);
    }

    let features = Array2::from_shape_vec((labels.len(), PIXELS), pixels).map_err(|err| {
        DatasetError::Format {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    info!("loaded {} digits from {}", labels.len(), path.display());
    Dataset::new(features, labels, DIGITS)
}

fn read_gz(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let mut bytes = Vec::new();
    GzDecoder::new(open(path)?)
        .read_to_end(&mut bytes)
        .map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(bytes)
}

// Big-endian u32 header fields, followed by the remaining payload.
fn idx_header<'a>(
    path: &Path,
    bytes: &'a [u8],
    fields: usize,
) -> Result<(Vec<u32>, &'a [u8]), DatasetError> {
    if bytes.len() < fields * 4 {
        return Err(DatasetError::Format {
            path: path.to_path_buf(),
            message: format!("file is too short for a {fields}-field header"),
        });
    }
    let (header, payload) = bytes.split_at(fields * 4);
    let header = header
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((header, payload))
}

// Read a pair of gzipped IDX files (as distributed on the MNIST site) into a dataset. Pixels are
// returned as raw byte intensities in 0..=255.
pub fn load_idx(images_path: &Path, labels_path: &Path) -> Result<Dataset, DatasetError> {
    let format_error = |path: &Path, message: String| DatasetError::Format {
        path: path.to_path_buf(),
        message,
    };

    let image_bytes = read_gz(images_path)?;
    let (header, image_payload) = idx_header(images_path, &image_bytes, 4)?;
    if header[0] != IMAGE_MAGIC {
        return Err(format_error(
            images_path,
            format!("magic number {} is not {IMAGE_MAGIC}", header[0]),
        ));
    }
    let (images, rows, columns) = (header[1] as usize, header[2] as usize, header[3] as usize);

    let label_bytes = read_gz(labels_path)?;
    let (header, label_payload) = idx_header(labels_path, &label_bytes, 2)?;
    if header[0] != LABEL_MAGIC {
        return Err(format_error(
            labels_path,
            format!("magic number {} is not {LABEL_MAGIC}", header[0]),
        ));
    }
    let labels = header[1] as usize;

    if images != labels {
        return Err(format_error(
            labels_path,
            format!("{labels} labels for {images} images"),
        ));
    }
    let pixels = rows * columns;
    if pixels == 0 || image_payload.len() < images * pixels || label_payload.len() < labels {
        return Err(format_error(images_path, "payload is shorter than the header claims".into()));
    }

    let mut features = Array2::zeros((images, pixels));
    for (mut row, image) in features
        .outer_iter_mut()
        .zip(&image_payload.iter().chunks(pixels))
    {
        for (cell, &byte) in row.iter_mut().zip(image) {
            *cell = byte as f64;
        }
    }
    let labels = label_payload[..labels].iter().map(|&label| label as usize).collect();

    info!(
        "loaded {images} {rows}x{columns} digits from {}",
        images_path.display()
    );
    Dataset::new(features, labels, DIGITS)
}

// Shade one image as text, one line per pixel row. Intensities are taken relative to the image's
// brightest pixel so raw and scaled inputs render the same.
pub fn render_digit(pixels: &[f64], width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    let max = pixels.iter().fold(0.0_f64, |max, &p| max.max(p.abs()));
    let scale = if max > 0.0 { max } else { 1.0 };

    pixels
        .chunks(width)
        .map(|row| {
            row.iter()
                .map(|&p| match p / scale {
                    a if a < 0.2 => ' ',
                    a if a < 0.4 => '░',
                    a if a < 0.6 => '▒',
                    a if a < 0.8 => '▓',
                    _ => '█',
                })
                .collect::<String>()
        })
        .join("\n")
}

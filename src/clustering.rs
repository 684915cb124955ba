//! Density-based grouping of matched keypoint locations.

use linfa::{traits::Transformer, ParamGuard};
use linfa_clustering::{Dbscan, DbscanParamsError};
use ndarray::Array2;
use opencv::core::{Point2f, Rect};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Neighborhood radius in pixels.
    pub eps: f64,
    /// Minimum number of points forming a dense region.
    pub min_points: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            eps: 20.0,
            min_points: 5,
        }
    }
}

/// Group `points` into dense clusters. Points labelled as noise are dropped.
pub fn cluster_points(
    points: &[Point2f],
    config: &ClusterConfig,
) -> Result<Vec<Vec<Point2f>>, DbscanParamsError> {
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let observations = Array2::from_shape_fn((points.len(), 2), |(row, col)| {
        let point = points[row];
        if col == 0 {
            point.x as f64
        } else {
            point.y as f64
        }
    });

    let labels = Dbscan::params(config.min_points)
        .tolerance(config.eps)
        .check()?
        .transform(&observations);

    let num_clusters = labels.iter().flatten().max().map_or(0, |max| max + 1);
    let mut clusters = vec![Vec::new(); num_clusters];
    for (point, label) in points.iter().zip(labels.iter()) {
        if let Some(cluster) = label {
            clusters[*cluster].push(*point);
        }
    }
    clusters.retain(|cluster| !cluster.is_empty());

    Ok(clusters)
}

/// Axis-aligned bounds of a point set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoundingBox {
    /// The smallest box containing every point, or `None` for no points.
    pub fn enclosing(points: &[Point2f]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let init = BoundingBox {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };

        Some(rest.iter().fold(init, |bounds, point| BoundingBox {
            min_x: bounds.min_x.min(point.x),
            min_y: bounds.min_y.min(point.y),
            max_x: bounds.max_x.max(point.x),
            max_y: bounds.max_y.max(point.y),
        }))
    }

    pub fn contains(&self, point: Point2f) -> bool {
        (self.min_x..=self.max_x).contains(&point.x) && (self.min_y..=self.max_y).contains(&point.y)
    }

    /// Integer pixel rectangle covering the box, as `imgproc::bounding_rect`
    /// computes it for the same points.
    pub fn to_rect(&self) -> Rect {
        let x = self.min_x.floor() as i32;
        let y = self.min_y.floor() as i32;
        Rect::new(
            x,
            y,
            self.max_x.floor() as i32 - x + 1,
            self.max_y.floor() as i32 - y + 1,
        )
    }
}

//! IoU computation, non-maximum suppression and Hungarian assignment.
use pathfinding::{matrix::Matrix, prelude::kuhn_munkres_min};

/// Fixed-point scale applied to IoU costs so the assignment runs on
/// integer weights.
const COST_SCALE: f64 = 1_000_000.0;

/// Intersection over union of two `[x, y, w, h]` boxes.
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f64 {
    let [ax, ay, aw, ah] = a.map(f64::from);
    let [bx, by, bw, bh] = b.map(f64::from);

    let x1 = ax.max(bx);
    let y1 = ay.max(by);
    let x2 = (ax + aw).min(bx + bw);
    let y2 = (ay + ah).min(by + bh);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = aw * ah + bw * bh - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy non-maximum suppression: keeps the highest scoring boxes,
/// dropping any box overlapping a kept one beyond `max_overlap`.
/// Returns the indices of the surviving boxes, in descending score order.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], max_overlap: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| {
        scores
            .get(b)
            .partial_cmp(&scores.get(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<usize> = Vec::new();
    for candidate in order {
        let Some(candidate_box) = boxes.get(candidate) else {
            continue;
        };
        let suppressed = kept.iter().any(|&keep| {
            boxes
                .get(keep)
                .is_some_and(|kept_box| iou(*kept_box, *candidate_box) > max_overlap)
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Result of associating detections to tracks.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AssignmentOutcome {
    /// `(track_index, detection_index)` pairs.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Hungarian assignment on cost `1 - IoU`, gated at `max_iou_distance`:
/// pairs whose cost exceeds the gate are treated as unmatched.
pub fn assign(
    tracks: &[[f32; 4]],
    detections: &[[f32; 4]],
    max_iou_distance: f64,
) -> AssignmentOutcome {
    if tracks.is_empty() || detections.is_empty() {
        return AssignmentOutcome {
            matches: Vec::new(),
            unmatched_tracks: (0..tracks.len()).collect(),
            unmatched_detections: (0..detections.len()).collect(),
        };
    }

    // kuhn_munkres requires at least as many columns as rows; transpose
    // when there are more tracks than detections.
    let transposed = tracks.len() > detections.len();
    let (rows, columns) = if transposed {
        (detections, tracks)
    } else {
        (tracks, detections)
    };

    let cost = |row: &[f32; 4], column: &[f32; 4]| ((1.0 - iou(*row, *column)) * COST_SCALE) as i64;
    let weights = Matrix::from_fn(rows.len(), columns.len(), |(r, c)| {
        match (rows.get(r), columns.get(c)) {
            (Some(row), Some(column)) => cost(row, column),
            _ => COST_SCALE as i64,
        }
    });

    let (_, column_of_row) = kuhn_munkres_min(&weights);

    let gate = (max_iou_distance * COST_SCALE) as i64;

    let mut matches = Vec::new();
    for (row, column) in column_of_row.iter().enumerate() {
        let (Some(row_box), Some(column_box)) = (rows.get(row), columns.get(*column)) else {
            continue;
        };
        if cost(row_box, column_box) <= gate {
            matches.push(if transposed {
                (*column, row)
            } else {
                (row, *column)
            });
        }
    }

    let matched_tracks: Vec<usize> = matches.iter().map(|(t, _)| *t).collect();
    let matched_detections: Vec<usize> = matches.iter().map(|(_, d)| *d).collect();
    AssignmentOutcome {
        unmatched_tracks: (0..tracks.len())
            .filter(|t| !matched_tracks.contains(t))
            .collect(),
        unmatched_detections: (0..detections.len())
            .filter(|d| !matched_detections.contains(d))
            .collect(),
        matches,
    }
}

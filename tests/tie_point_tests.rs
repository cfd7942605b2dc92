// SPDX-License-Identifier: MPL-2.0

//! Integration tests for tie-point calibration

use approx::assert_abs_diff_eq;
use kinect3d::ErrorKind;
use kinect3d::calibration::{IntrinsicParameters, LensDistortion, TiePointPair, TiePointSolver};
use kinect3d::codecs::{IntrinsicFile, IntrinsicLayout};
use kinect3d::geometry::ProjectiveTransform;
use kinect3d::Size;

const COLOR_SIZE: Size = Size::new(640, 480);

fn five_pairs() -> Vec<TiePointPair> {
    [
        ([0.0, 0.0, 1000.0], [320.0, 240.0]),
        ([100.0, 0.0, 1000.0], [384.0, 240.0]),
        ([0.0, 100.0, 1000.0], [320.0, 304.0]),
        ([100.0, 100.0, 1000.0], [384.0, 304.0]),
        ([0.0, 0.0, 2000.0], [320.0, 240.0]),
    ]
    .into_iter()
    .map(|(camera_point, color_point)| TiePointPair {
        camera_point,
        color_point,
    })
    .collect()
}

#[test]
fn test_five_pair_calibration_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let json = dir.path().join("tiepoints.json");
    std::fs::write(&json, serde_json::to_string(&five_pairs()).unwrap()).unwrap();

    let solver = TiePointSolver::load_json(&json).unwrap();
    assert_eq!(solver.len(), 5);
    let (path, solution) = solver
        .write_intrinsics(
            dir.path(),
            "A00363A14660053A",
            COLOR_SIZE,
            &IntrinsicParameters::default(),
        )
        .unwrap();
    assert!(solution.rms <= 1e-6, "rms {}", solution.rms);
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "IntrinsicParameters-A00363A14660053A.dat"
    );

    let (ips, layout) = IntrinsicFile::load(&path).unwrap();
    assert_eq!(layout, IntrinsicLayout::Legacy);
    for pair in five_pairs() {
        let [x, y, z] = pair.camera_point;
        let h = ips.color_projection.transform_homogeneous([x, y, z, 1.0]);
        assert_abs_diff_eq!(h[0] / h[3] * 640.0, pair.color_point[0], epsilon = 1e-6);
        assert_abs_diff_eq!(h[1] / h[3] * 480.0, pair.color_point[1], epsilon = 1e-6);
    }
}

#[test]
fn test_full_layout_lens_distortion_survives_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let mut depth_lens = LensDistortion::default();
    depth_lens.center = [0.01, -0.02];
    depth_lens.kappa = [0.1, -0.05, 0.01, 0.0, 0.002, 0.0];
    let mut color_lens = LensDistortion::default();
    color_lens.rho = [1e-4, 2e-4];
    let depth_file = dir.path().join("depth-intrinsics.dat");
    IntrinsicFile::save(
        &depth_file,
        &IntrinsicParameters::new(
            depth_lens,
            ProjectiveTransform::identity(),
            color_lens,
            ProjectiveTransform::identity(),
        ),
        IntrinsicLayout::Full,
    )
    .unwrap();

    let (base, _) = IntrinsicFile::load(&depth_file).unwrap();
    let solver = TiePointSolver::from_pairs(five_pairs());
    let (path, _) = solver
        .write_intrinsics(dir.path(), "B00362", COLOR_SIZE, &base)
        .unwrap();

    let (ips, layout) = IntrinsicFile::load(&path).unwrap();
    assert_eq!(layout, IntrinsicLayout::Full);
    assert_eq!(ips.depth_lens_distortion, depth_lens);
    assert_eq!(ips.color_lens_distortion, color_lens);
    let h = ips.color_projection.transform_homogeneous([100.0, 100.0, 1000.0, 1.0]);
    assert_abs_diff_eq!(h[0] / h[3] * 640.0, 384.0, epsilon = 1e-6);
}

#[test]
fn test_too_few_pairs_is_not_found() {
    let mut solver = TiePointSolver::from_pairs(five_pairs());
    solver.clear();
    for pair in five_pairs().into_iter().take(4) {
        solver.add_pair(pair.camera_point, pair.color_point);
    }
    let err = solver.solve(COLOR_SIZE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_missing_or_empty_tie_point_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = TiePointSolver::load_json(&dir.path().join("missing.json")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let empty = dir.path().join("empty.json");
    std::fs::write(&empty, "[]").unwrap();
    let err = TiePointSolver::load_json(&empty).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

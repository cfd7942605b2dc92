// SPDX-License-Identifier: MPL-2.0

//! Integration tests for constants module

use kinect3d::constants::{ColorSpace, FrameKind, Size, formats, protocol};
use kinect3d::INVALID_DEPTH;

#[test]
fn test_frame_kind_values() {
    // Test that both kinds exist in wire order (color, depth)
    assert_eq!(FrameKind::ALL.len(), 2);
    for (i, kind) in FrameKind::ALL.iter().enumerate() {
        assert_eq!(kind.index(), i);
    }
}

#[test]
fn test_frame_ids_decode_to_kinds() {
    for stream in 0..4u32 {
        for kind in FrameKind::ALL {
            let frame_id = stream * 2 + kind.index() as u32;
            assert_eq!(FrameKind::from_frame_id(frame_id), kind);
        }
    }
}

#[test]
fn test_display_names() {
    for kind in FrameKind::ALL {
        assert!(!kind.display_name().is_empty());
    }
    for space in ColorSpace::ALL {
        assert!(!space.display_name().is_empty());
    }
}

#[test]
fn test_endianness_markers_mirror() {
    assert_eq!(protocol::ENDIAN_MARKER.swap_bytes(), protocol::SWAPPED_ENDIAN_MARKER);
    assert_eq!(protocol::GOODBYE, 0);
}

#[test]
fn test_format_constants() {
    assert_eq!(INVALID_DEPTH, 0x07FF);
    assert_eq!(formats::LEGACY_INTRINSIC_FILE_SIZE, 296);
    let size = Size::new(640, 480);
    assert_eq!(size.volume(), 307_200);
    assert_eq!(size.index(1, 1), 641);
    assert_eq!(size.to_string(), "640x480");
}

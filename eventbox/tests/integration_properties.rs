//! Property tests for the controller policy and the record migration shim.

use eventbox::codec::{CoordSize, Direction, EventDataVersion, EventKind, EventSchema};
use eventbox::controller::BoxController;
use proptest::{collection::vec, option, prelude::*};

prop_compose! {
    /// A controller with arbitrary fan-out, a partial top-level override,
    /// and a few splits already tracked.
    fn controller()
        (n_dims in 1..=4usize)
        (split in vec(1..=6usize, n_dims),
         top in vec(option::of(1..=8usize), n_dims),
         threshold in 0..10_000u64,
         max_depth in 0..=6usize,
         max_id in 0..1_000u64,
         splits in vec(0..6usize, 0..8))
    -> BoxController {
        let mut bc = BoxController::new(split.len()).unwrap();
        for (dim, &n) in split.iter().enumerate() {
            bc.set_split_into_dim(dim, n).unwrap();
        }
        for (dim, n) in top.iter().enumerate() {
            if let Some(n) = *n {
                bc.set_split_top_into(dim, n).unwrap();
            }
        }
        bc.set_split_threshold(threshold);
        bc.set_max_depth(max_depth).unwrap();
        bc.set_max_id(max_id);
        // Only split depths that still hold a leaf, so the leaves keep
        // tiling the root.
        for depth in splits {
            if depth < max_depth && bc.num_md_boxes()[depth] > 0 {
                bc.track_num_boxes(depth).unwrap();
            }
        }
        bc
    }
}

prop_compose! {
    /// Whole `Original` records as stored on disk: signal, error², run,
    /// detector, then the coordinates.
    fn original_block()
        (n_dims in 1..=4usize, n_events in 0..40usize)
        (data in vec(-1e6..1e6f64, n_events * (n_dims + 4)), n_dims in Just(n_dims))
    -> (usize, Vec<f64>) {
        (n_dims, data)
    }
}

proptest! {
    #[test]
    fn num_split_is_product_of_split_into(bc in controller()) {
        let product: usize = (0..bc.n_dims()).map(|dim| bc.split_into(dim).unwrap()).product();
        prop_assert_eq!(bc.num_split(), product);
        prop_assert_eq!(bc.num_split_for_depth(1), product);
    }

    #[test]
    fn top_level_override_falls_back_per_dimension(bc in controller()) {
        let top = bc.split_for_depth(0);
        prop_assert_eq!(bc.num_split_for_depth(0), top.iter().product::<usize>());
        match bc.split_top_into() {
            Some(resolved) => prop_assert_eq!(resolved, top),
            None => {
                let regular: Vec<usize> =
                    (0..bc.n_dims()).map(|dim| bc.split_into(dim).unwrap()).collect();
                prop_assert_eq!(top, regular);
            }
        }
    }

    #[test]
    fn will_split_matches_threshold_and_depth(
        bc in controller(),
        signal in 0..20_000u64,
        depth in 0..10usize,
    ) {
        prop_assert_eq!(
            bc.will_split(signal, depth),
            signal > bc.split_threshold() && depth < bc.max_depth()
        );
    }

    #[test]
    fn xml_round_trip(bc in controller()) {
        let xml = bc.to_xml_string();
        let parsed = BoxController::from_xml_string(&xml).unwrap();
        prop_assert_eq!(&parsed, &bc);
        prop_assert_eq!(parsed.split_top_into(), bc.split_top_into());
        prop_assert_eq!(parsed.max_num_md_boxes(), bc.max_num_md_boxes());
        prop_assert_eq!(parsed.average_depth(), bc.average_depth());
        prop_assert_eq!(parsed.to_xml_string(), xml);
    }

    #[test]
    fn json_round_trip(bc in controller()) {
        let parsed = BoxController::from_json(&bc.to_json().unwrap()).unwrap();
        prop_assert_eq!(&parsed, &bc);
        prop_assert_eq!(parsed.settings(), bc.settings());
    }

    #[test]
    fn average_depth_is_finite_and_bounded(bc in controller()) {
        let depth = bc.average_depth();
        prop_assert!(depth.is_finite());
        prop_assert!(depth >= 0.0);
        #[allow(clippy::cast_precision_loss)]
        let max_depth = bc.max_depth() as f64;
        prop_assert!(depth <= max_depth + 1e-9);
    }

    #[test]
    fn original_read_then_write_is_identity((n_dims, disk) in original_block()) {
        let layout =
            EventSchema::new(CoordSize::Double, EventKind::MdEvent, EventDataVersion::Original)
                .unwrap()
                .layout(n_dims);
        prop_assert_eq!(layout.data_event_count(), n_dims + 4);

        let memory = layout.adjust_event_data_block(disk.clone(), Direction::Read).unwrap();
        prop_assert_eq!(memory.len(), disk.len() / (n_dims + 4) * (n_dims + 5));
        let back = layout.adjust_event_data_block(memory, Direction::Write).unwrap();
        prop_assert_eq!(back, disk);
    }
}

//! End-to-end scenarios that exercise several modules together, rather
//! than one unit in isolation.

use float_cmp::approx_eq;

use crate::antigen_serum::{Antigen, Serum};
use crate::chart::{Chart, Info};
use crate::column_bases::{ColumnBases, MinimumColumnBasis};
use crate::io;
use crate::merge::{merge, MergeSettings, ProjectionMergeType};
use crate::optimize::{relax, OptimizationOptions};
use crate::projection::Projection;
use crate::serum_circle::theoretical_radius;
use crate::table::TiterTable;
use crate::titer::Titer;

fn antigen(name: &str) -> Antigen {
    Antigen {
        name: name.to_string(),
        ..Antigen::default()
    }
}

fn serum(name: &str) -> Serum {
    Serum {
        name: name.to_string(),
        ..Serum::default()
    }
}

#[test]
fn dont_care_row_keeps_finite_coordinates_after_relax() {
    let chart = Chart::new(
        Info::default(),
        vec![antigen("A1"), antigen("A2"), antigen("A3")],
        vec![serum("S1"), serum("S2")],
        TiterTable::from_dense(vec![
            vec![Titer::Regular(40), Titer::Regular(80)],
            vec![Titer::DontCare, Titer::DontCare],
            vec![Titer::Regular(160), Titer::Regular(320)],
        ])
        .unwrap(),
    )
    .unwrap();

    let mut projection = Projection::new(5, 2);
    let status = relax(&chart, &mut projection, &OptimizationOptions::default(), Some(1)).unwrap();
    assert!(status.final_stress.is_finite());
    assert!(projection.layout().point_has_coordinates(1));
}

#[test]
fn dense_sparse_round_trip_preserves_titers_and_non_dont_care_count() {
    let dense = TiterTable::from_dense(vec![
        vec![Titer::Regular(40), Titer::LessThan(10)],
        vec![Titer::DontCare, Titer::Regular(160)],
    ])
    .unwrap();
    assert_eq!(dense.number_of_non_dont_cares(), 3);

    let sparse = dense.to_sparse();
    assert_eq!(sparse.number_of_non_dont_cares(), 3);
    let back_to_dense = sparse.to_dense();
    for ag in 0..2 {
        for sr in 0..2 {
            assert_eq!(dense.titer(ag, sr), back_to_dense.titer(ag, sr));
        }
    }
}

#[test]
fn merge_type2_preserves_primary_coordinates_and_leaves_secondary_only_antigens_disconnected() {
    let sera = vec![serum("S1")];

    let mut primary = Chart::new(
        Info::default(),
        vec![antigen("A1"), antigen("A2")],
        sera.clone(),
        TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::Regular(80)]]).unwrap(),
    )
    .unwrap();
    let mut primary_layout = crate::layout::Layout::new(3, 2);
    primary_layout.set_point(0, &[0.0, 0.0]);
    primary_layout.set_point(1, &[1.0, 0.0]);
    primary_layout.set_point(2, &[0.0, 1.0]);
    let mut primary_projection = Projection::from_layout(primary_layout);
    primary_projection.set_stress(0.0);
    primary.push_projection(primary_projection);

    let secondary = Chart::new(
        Info::default(),
        vec![antigen("A3")],
        sera,
        TiterTable::from_dense(vec![vec![Titer::Regular(160)]]).unwrap(),
    )
    .unwrap();

    let settings = MergeSettings {
        projection_merge: ProjectionMergeType::Type2,
        ..MergeSettings::default()
    };
    let (merged, _data) = merge(&primary, &secondary, &settings).unwrap();

    assert_eq!(merged.number_of_antigens(), 3);
    let projection = merged.best_projection().expect("type2 carries a projection");
    assert_eq!(projection.layout().point(0).unwrap(), &[0.0, 0.0]);
    assert_eq!(projection.layout().point(1).unwrap(), &[1.0, 0.0]);
    assert!(!projection.layout().point_has_coordinates(2));
}

#[test]
fn theoretical_radius_matches_worked_example() {
    let chart = Chart::new(
        Info::default(),
        vec![antigen("HOMOLOGOUS")],
        vec![serum("HOMOLOGOUS")],
        TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
    )
    .unwrap();
    let column_bases = ColumnBases::from_values(vec![4.0], MinimumColumnBasis::None);
    let result = theoretical_radius(&chart, &column_bases, 0, 2.0);
    assert_eq!(result.radius, Some(4.0));
}

#[test]
fn raising_minimum_column_basis_never_decreases_effective_column_bases() {
    let titers = TiterTable::from_dense(vec![
        vec![Titer::Regular(40), Titer::Regular(20)],
        vec![Titer::Regular(160), Titer::Regular(80)],
    ])
    .unwrap();
    let low = ColumnBases::compute(&titers, MinimumColumnBasis::None);
    let high = ColumnBases::compute(&titers, MinimumColumnBasis::Fixed(1280));
    for s in 0..titers.number_of_sera() {
        assert!(high.get(s) >= low.get(s));
    }
}

#[test]
fn canonical_json_round_trip_preserves_titers_and_antigen_names() {
    let chart = Chart::new(
        Info::default(),
        vec![antigen("A1"), antigen("A2")],
        vec![serum("S1")],
        TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::LessThan(10)]]).unwrap(),
    )
    .unwrap();

    let bytes = io::export(&chart).unwrap();
    let reimported = io::import(&bytes, None).unwrap();

    assert_eq!(reimported.antigens().len(), chart.antigens().len());
    for (a, b) in chart.antigens().iter().zip(reimported.antigens()) {
        assert_eq!(a.name, b.name);
    }
    for ag in 0..chart.number_of_antigens() {
        assert_eq!(chart.titers().titer(ag, 0), reimported.titers().titer(ag, 0));
    }
}

#[test]
fn procrustes_identity_on_same_layout_has_zero_rms_and_identity_rotation() {
    let mut layout = crate::layout::Layout::new(3, 2);
    layout.set_point(0, &[0.0, 0.0]);
    layout.set_point(1, &[3.0, 0.0]);
    layout.set_point(2, &[0.0, 4.0]);

    let result = crate::procrustes::align(&layout, &layout, &[(0, 0), (1, 1), (2, 2)], false).unwrap();
    assert!(approx_eq!(f64, result.rms, 0.0, epsilon = 1e-9));
    let identity = crate::layout::Transformation::identity(2);
    for (a, b) in result.transformation.matrix().iter().zip(identity.matrix()) {
        assert!(approx_eq!(f64, *a, *b, epsilon = 1e-9));
    }
}

use crate::params::{double_range, integer_range, ParameterSet, ProgramParameter};

#[test]
pub fn double_range_inclusive() {
    assert_eq!(double_range(0.0, 10.0, 5), vec![0.0, 2.5, 5.0, 7.5, 10.0]);
    assert_eq!(double_range(3.0, 7.0, 1), vec![3.0]);
    assert!(double_range(0.0, 1.0, 0).is_empty());
}

#[test]
pub fn integer_range_shrinks_on_duplicates() {
    // 0, 0.5, 1, 1.5, 2 rounds to 0, 1, 1, 2, 2
    assert_eq!(integer_range(0, 2, 5), vec![0, 1, 2]);
    assert_eq!(integer_range(0, 10, 3), vec![0, 5, 10]);
}

#[test]
pub fn string_grid_is_option_list() {
    let parameter = ProgramParameter::String {
        options: vec!["single".into(), "complete".into()],
        default: "single".into(),
    };

    assert_eq!(parameter.grid(17), vec!["single", "complete"]);
}

#[test]
pub fn numeric_options_replace_the_range() {
    let parameter = ProgramParameter::Integer {
        min: 1,
        max: 100,
        default: 2,
        options: vec![2, 8, 32],
    };
    assert_eq!(parameter.grid(10), vec!["2", "8", "32"]);

    let parameter = ProgramParameter::Double {
        min: 0.0,
        max: 1.0,
        default: 0.5,
        options: Vec::new(),
    };
    assert_eq!(parameter.grid(3), vec!["0", "0.5", "1"]);
}

#[test]
pub fn joined_values_follow_column_order() {
    let set: ParameterSet = [("b", "2"), ("a", "1")].into_iter().collect();
    let columns = ["b", "a"];

    let joined = set.values_joined(&columns);
    assert_eq!(joined, "2,1");
    assert_eq!(ParameterSet::from_joined(&columns, &joined), Some(set));
    assert_eq!(ParameterSet::from_joined(&columns, "1"), None);
}

#[test]
pub fn restrict_drops_foreign_parameters() {
    let set: ParameterSet = [("k", "3"), ("seed", "42")].into_iter().collect();

    assert_eq!(set.restrict(&["k"]), [("k", "3")].into_iter().collect());
}

#[test]
pub fn deserialize_tagged_parameter() {
    let parameter: ProgramParameter =
        serde_yaml::from_str("type: integer\nmin: 2\nmax: 20\ndefault: 5\n").unwrap();

    assert_eq!(parameter.bounds(), Some((2.0, 20.0)));
    assert_eq!(parameter.default_value(), "5");
    assert!(parameter.validate("k").is_ok());
}

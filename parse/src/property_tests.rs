/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use proptest::prelude::*;

use crate::expand::{expand, expand_recipe, expand_suffixes, Vars};

proptest! {
    /// Words with no expansion characters pass through untouched.
    #[test]
    fn expand_is_identity_on_plain_words(word in "[a-zA-Z0-9_./-]{1,24}") {
        let parts = expand(&word, &Vars::new(), false).expect("expand");
        prop_assert_eq!(parts, vec![word]);
    }

    /// Suffix expansion of a template with no '%' is the template itself.
    #[test]
    fn suffix_expansion_without_percent(template in "[a-zA-Z0-9_./-]{0,24}", stem in "[a-z]{1,8}") {
        prop_assert_eq!(expand_suffixes(&template, &stem), template);
    }

    /// Every '%' in a plain template becomes the stem.
    #[test]
    fn suffix_expansion_replaces_each_percent(prefix in "[a-z]{0,8}", suffix in "[a-z.]{0,8}", stem in "[a-z]{1,8}") {
        let template = format!("{}%{}", prefix, suffix);
        let expect = format!("{}{}{}", prefix, stem, suffix);
        prop_assert_eq!(expand_suffixes(&template, &stem), expect);
    }

    /// A single-valued variable round-trips through both expanders.
    #[test]
    fn single_value_reference_round_trips(name in "[a-z_][a-z0-9_]{0,12}", value in "[a-zA-Z0-9_.-]{1,16}") {
        let mut vars = Vars::new();
        vars.insert(name.clone(), vec![value.clone()]);
        let reference = format!("${{{}}}", name);
        prop_assert_eq!(expand(&reference, &vars, false).expect("expand"), vec![value.clone()]);
        prop_assert_eq!(expand_recipe(&reference, &vars, false), value);
    }

    /// Multi-valued variables split under expand and join under
    /// expand_recipe.
    #[test]
    fn multi_value_reference(values in proptest::collection::vec("[a-z]{1,6}", 1..5)) {
        let mut vars = Vars::new();
        vars.insert("v".to_owned(), values.clone());
        prop_assert_eq!(expand("$v", &vars, false).expect("expand"), values.clone());
        prop_assert_eq!(expand_recipe("$v", &vars, false), values.join(" "));
    }
}

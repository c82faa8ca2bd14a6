use std::collections::HashMap;

use anyhow::Context;
use duckdb::{Connection, params};
use serde::Serialize;

/// Fixed age buckets for the demographics breakdown. A trial counts toward a
/// bucket when its eligibility interval intersects the bucket interval
/// (min_age <= bucket.max AND max_age >= bucket.min), not when it is
/// contained by it.
pub const AGE_RANGES: [AgeRange; 5] = [
    AgeRange { label: "18-30", min: 18, max: 30 },
    AgeRange { label: "31-45", min: 31, max: 45 },
    AgeRange { label: "46-60", min: 46, max: 60 },
    AgeRange { label: "61-75", min: 61, max: 75 },
    AgeRange { label: "76+", min: 76, max: 150 },
];

#[derive(Debug, Clone, Copy)]
pub struct AgeRange {
    pub label: &'static str,
    pub min: i64,
    pub max: i64,
}

// Joiner for string_agg over affiliation/role sets; split back out in Rust.
const AGG_SEP: char = '\u{1f}';

#[derive(Debug, Clone, Serialize)]
pub struct CountryCount {
    pub country: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SexCount {
    pub sex: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeRangeCount {
    pub age_range: String,
    pub count: i64,
    pub min_age: i64,
    pub max_age: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    pub sex_distribution: Vec<SexCount>,
    pub age_distribution: Vec<AgeRangeCount>,
    pub total_trials: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityTrials {
    pub city: String,
    pub country: String,
    pub trial_count: i64,
    pub facility_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialEntry {
    pub name: String,
    pub affiliations: Vec<String>,
    pub roles: Vec<String>,
    pub trial_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: i64,
    pub total_pages: i64,
    pub total_items: i64,
    pub items_per_page: i64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfficialsPage {
    pub data: Vec<OfficialEntry>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialLocation {
    pub facility: String,
    pub city: String,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSummary {
    pub id: i64,
    pub sex: String,
    pub min_age: i64,
    pub max_age: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_year: Option<i64>,
    pub locations: Vec<TrialLocation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialsByYear {
    pub total_trials: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    pub trials: Vec<TrialSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub total_trials: i64,
    pub total_countries: i64,
    pub total_cities: i64,
    pub total_facilities: i64,
}

/// Count of (trial, location) pairs per country, most frequent first. A trial
/// with three locations contributes three.
pub fn location_distribution(conn: &Connection) -> anyhow::Result<Vec<CountryCount>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT country, COUNT(*)::BIGINT AS cnt
        FROM trial_locations
        GROUP BY country
        ORDER BY cnt DESC, country ASC
    "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CountryCount {
            country: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn demographics(conn: &Connection) -> anyhow::Result<Demographics> {
    let total = one_i64(conn, "SELECT COUNT(*)::BIGINT FROM trials")?;

    let mut sex_distribution = {
        let mut stmt = conn.prepare(
            r#"
            SELECT sex, COUNT(*)::BIGINT AS cnt
            FROM trials
            GROUP BY sex
            ORDER BY cnt DESC, sex ASC
        "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SexCount {
                sex: row.get(0)?,
                count: row.get(1)?,
                percentage: 0.0,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        out
    };
    for s in &mut sex_distribution {
        s.percentage = percentage(s.count, total);
    }

    let mut age_distribution = Vec::with_capacity(AGE_RANGES.len());
    for range in AGE_RANGES {
        let mut stmt = conn.prepare(
            "SELECT COUNT(*)::BIGINT FROM trials WHERE min_age <= ? AND max_age >= ?",
        )?;
        let count: i64 = stmt.query_row(params![range.max, range.min], |row| row.get(0))?;
        age_distribution.push(AgeRangeCount {
            age_range: range.label.to_string(),
            count,
            min_age: range.min,
            max_age: range.max,
        });
    }

    Ok(Demographics {
        sex_distribution,
        age_distribution,
        total_trials: total,
    })
}

/// Top cities by trial volume, grouped by (city, country) so same-named
/// cities in different countries stay separate. trial_count counts location
/// entries in the group, so a trial with two facilities in one city counts
/// twice there.
pub fn trials_per_city(conn: &Connection, limit: i64) -> anyhow::Result<Vec<CityTrials>> {
    let limit = limit.clamp(1, 100);
    let sql = format!(
        r#"
        SELECT
          city,
          country,
          COUNT(*)::BIGINT AS trial_count,
          COUNT(DISTINCT facility)::BIGINT AS facility_count
        FROM trial_locations
        GROUP BY city, country
        ORDER BY trial_count DESC, city ASC, country ASC
        LIMIT {limit}
    "#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(CityTrials {
            city: row.get(0)?,
            country: row.get(1)?,
            trial_count: row.get(2)?,
            facility_count: row.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Officials grouped by name with their deduplicated non-null affiliation and
/// role sets, most-referenced first, paginated.
pub fn officials(conn: &Connection, page: i64, limit: i64) -> anyhow::Result<OfficialsPage> {
    let page = page.max(1);
    let limit = limit.clamp(1, 100);
    let total = one_i64(conn, "SELECT COUNT(DISTINCT name)::BIGINT FROM trial_officials")?;
    let offset = (page - 1) * limit;

    let sql = format!(
        r#"
        SELECT
          name,
          COUNT(*)::BIGINT AS trial_count,
          string_agg(DISTINCT affiliation, '{sep}') AS affiliations,
          string_agg(DISTINCT role, '{sep}') AS roles
        FROM trial_officials
        GROUP BY name
        ORDER BY trial_count DESC, name ASC
        LIMIT {limit} OFFSET {offset}
    "#,
        sep = AGG_SEP
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(OfficialEntry {
            name: row.get(0)?,
            trial_count: row.get(1)?,
            affiliations: split_agg(row.get::<usize, Option<String>>(2)?),
            roles: split_agg(row.get::<usize, Option<String>>(3)?),
        })
    })?;
    let mut data = Vec::new();
    for r in rows {
        data.push(r?);
    }

    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(OfficialsPage {
        data,
        pagination: Pagination {
            current_page: page,
            total_pages,
            total_items: total,
            items_per_page: limit,
            has_next_page: page * limit < total,
            has_prev_page: page > 1,
        },
    })
}

/// Trials whose start year is >= the given year; no filter when absent.
pub fn trials_by_year(conn: &Connection, year: Option<i64>) -> anyhow::Result<TrialsByYear> {
    let where_sql = match year {
        Some(y) => format!("WHERE start_year >= {y}"),
        None => String::new(),
    };

    let total = one_i64(
        conn,
        &format!("SELECT COUNT(*)::BIGINT FROM trials {where_sql}"),
    )?;

    let sql = format!(
        "SELECT trial_id, sex, min_age, max_age, start_year FROM trials {where_sql} ORDER BY trial_id ASC"
    );
    let mut trials = Vec::new();
    let mut by_id: HashMap<i64, usize> = HashMap::new();
    {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(TrialSummary {
                id: row.get(0)?,
                sex: row.get(1)?,
                min_age: row.get(2)?,
                max_age: row.get(3)?,
                start_year: row.get(4)?,
                locations: Vec::new(),
            })
        })?;
        for r in rows {
            let t = r?;
            by_id.insert(t.id, trials.len());
            trials.push(t);
        }
    }

    let loc_sql = format!(
        r#"
        SELECT trial_id, facility, city, state, zip, country, status
        FROM trial_locations
        WHERE trial_id IN (SELECT trial_id FROM trials {where_sql})
        ORDER BY trial_id ASC, position ASC
    "#
    );
    attach_locations(conn, &loc_sql, &by_id, &mut trials).context("attach locations")?;

    Ok(TrialsByYear {
        total_trials: total,
        year,
        trials,
    })
}

pub fn summary_stats(conn: &Connection) -> anyhow::Result<SummaryStats> {
    Ok(SummaryStats {
        total_trials: one_i64(conn, "SELECT COUNT(*)::BIGINT FROM trials")?,
        total_countries: one_i64(
            conn,
            "SELECT COUNT(DISTINCT country)::BIGINT FROM trial_locations",
        )?,
        total_cities: one_i64(
            conn,
            "SELECT COUNT(DISTINCT city)::BIGINT FROM trial_locations",
        )?,
        total_facilities: one_i64(
            conn,
            "SELECT COUNT(DISTINCT facility)::BIGINT FROM trial_locations",
        )?,
    })
}

/// Trials for the given ids, in the order the ids were supplied (the search
/// engine's relevance order). Unknown ids are dropped. No start_year in the
/// projection.
pub fn trials_by_ids(conn: &Connection, ids: &[i64]) -> anyhow::Result<Vec<TrialSummary>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let id_list = ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let sql = format!(
        "SELECT trial_id, sex, min_age, max_age FROM trials WHERE trial_id IN ({id_list})"
    );
    let mut trials = Vec::new();
    let mut by_id: HashMap<i64, usize> = HashMap::new();
    {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(TrialSummary {
                id: row.get(0)?,
                sex: row.get(1)?,
                min_age: row.get(2)?,
                max_age: row.get(3)?,
                start_year: None,
                locations: Vec::new(),
            })
        })?;
        for r in rows {
            let t = r?;
            by_id.insert(t.id, trials.len());
            trials.push(t);
        }
    }

    let loc_sql = format!(
        r#"
        SELECT trial_id, facility, city, state, zip, country, status
        FROM trial_locations
        WHERE trial_id IN ({id_list})
        ORDER BY trial_id ASC, position ASC
    "#
    );
    attach_locations(conn, &loc_sql, &by_id, &mut trials).context("attach locations")?;

    // Restore the caller's ranking order.
    let mut slots: Vec<Option<TrialSummary>> = trials.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(slots.len());
    for id in ids {
        if let Some(&idx) = by_id.get(id) {
            if let Some(t) = slots[idx].take() {
                out.push(t);
            }
        }
    }
    Ok(out)
}

fn attach_locations(
    conn: &Connection,
    sql: &str,
    by_id: &HashMap<i64, usize>,
    trials: &mut [TrialSummary],
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<usize, i64>(0)?,
            TrialLocation {
                facility: row.get(1)?,
                city: row.get(2)?,
                state: row.get(3)?,
                zip: row.get(4)?,
                country: row.get(5)?,
                status: row.get(6)?,
            },
        ))
    })?;
    for r in rows {
        let (trial_id, loc) = r?;
        if let Some(&idx) = by_id.get(&trial_id) {
            trials[idx].locations.push(loc);
        }
    }
    Ok(())
}

fn one_i64(conn: &Connection, sql: &str) -> anyhow::Result<i64> {
    let mut stmt = conn.prepare(sql)?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v)
}

fn percentage(count: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 100.0 / total as f64 * 100.0).round() / 100.0
}

fn split_agg(v: Option<String>) -> Vec<String> {
    let Some(v) = v else {
        return Vec::new();
    };
    let mut items: Vec<String> = v
        .split(AGG_SEP)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    items.sort();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::create_schema;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory duckdb");
        create_schema(&conn).expect("create schema");
        conn
    }

    fn insert_trial(conn: &Connection, id: i64, sex: &str, min: i64, max: i64, year: Option<i64>) {
        conn.execute(
            "INSERT INTO trials (trial_id, sex, min_age, max_age, start_year) VALUES (?, ?, ?, ?, ?)",
            params![id, sex, min, max, year],
        )
        .expect("insert trial");
    }

    fn insert_location(conn: &Connection, trial_id: i64, pos: i64, facility: &str, city: &str, country: &str) {
        conn.execute(
            "INSERT INTO trial_locations (trial_id, position, facility, city, country) VALUES (?, ?, ?, ?, ?)",
            params![trial_id, pos, facility, city, country],
        )
        .expect("insert location");
    }

    fn insert_official(
        conn: &Connection,
        trial_id: i64,
        name: &str,
        affiliation: Option<&str>,
        role: Option<&str>,
    ) {
        conn.execute(
            "INSERT INTO trial_officials (trial_id, name, affiliation, role) VALUES (?, ?, ?, ?)",
            params![trial_id, name, affiliation, role],
        )
        .expect("insert official");
    }

    // Three trials: MALE 20-40 in Boston/US; FEMALE 50-70 in Boston/US and
    // Paris/FR; ALL 10-15 in Paris/FR.
    fn example_fixture() -> Connection {
        let conn = test_conn();
        insert_trial(&conn, 1, "MALE", 20, 40, Some(2018));
        insert_location(&conn, 1, 0, "Boston General", "Boston", "US");
        insert_trial(&conn, 2, "FEMALE", 50, 70, Some(2020));
        insert_location(&conn, 2, 0, "Boston General", "Boston", "US");
        insert_location(&conn, 2, 1, "Paris Central", "Paris", "FR");
        insert_trial(&conn, 3, "ALL", 10, 15, Some(2022));
        insert_location(&conn, 3, 0, "Paris Central", "Paris", "FR");
        conn
    }

    #[test]
    fn location_distribution_counts_location_pairs() {
        let conn = example_fixture();
        let dist = location_distribution(&conn).unwrap();
        // Four (trial, location) pairs total, two per country; ties break on
        // country name.
        assert_eq!(dist.len(), 2);
        assert_eq!((dist[0].country.as_str(), dist[0].count), ("FR", 2));
        assert_eq!((dist[1].country.as_str(), dist[1].count), ("US", 2));
        let total: i64 = dist.iter().map(|c| c.count).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn demographics_buckets_use_interval_intersection() {
        let conn = example_fixture();
        let d = demographics(&conn).unwrap();
        assert_eq!(d.total_trials, 3);

        let counts: Vec<(String, i64)> = d
            .age_distribution
            .iter()
            .map(|a| (a.age_range.clone(), a.count))
            .collect();
        // Trial 1 (20-40) intersects 18-30 and 31-45; trial 2 (50-70)
        // intersects 46-60 and 61-75; trial 3 (10-15) intersects none.
        assert_eq!(
            counts,
            vec![
                ("18-30".to_string(), 1),
                ("31-45".to_string(), 1),
                ("46-60".to_string(), 1),
                ("61-75".to_string(), 1),
                ("76+".to_string(), 0),
            ]
        );

        assert_eq!(d.sex_distribution.len(), 3);
        for s in &d.sex_distribution {
            assert_eq!(s.count, 1);
            assert_eq!(s.percentage, 33.33);
        }
    }

    #[test]
    fn trials_per_city_groups_by_city_and_country() {
        let conn = example_fixture();
        let cities = trials_per_city(&conn, 10).unwrap();
        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].city, "Boston");
        assert_eq!(cities[0].country, "US");
        assert_eq!(cities[0].trial_count, 2);
        assert_eq!(cities[0].facility_count, 1);
        assert_eq!(cities[1].city, "Paris");
        assert_eq!(cities[1].trial_count, 2);
    }

    #[test]
    fn trials_per_city_honors_limit() {
        let conn = example_fixture();
        let cities = trials_per_city(&conn, 1).unwrap();
        assert_eq!(cities.len(), 1);
    }

    #[test]
    fn same_named_cities_in_two_countries_stay_separate() {
        let conn = test_conn();
        insert_trial(&conn, 1, "ALL", 0, 120, None);
        insert_location(&conn, 1, 0, "X Clinic", "Springfield", "US");
        insert_trial(&conn, 2, "ALL", 0, 120, None);
        insert_location(&conn, 2, 0, "Y Clinic", "Springfield", "CA");

        let cities = trials_per_city(&conn, 10).unwrap();
        assert_eq!(cities.len(), 2);
        assert!(cities.iter().all(|c| c.city == "Springfield"));
        let countries: Vec<&str> = cities.iter().map(|c| c.country.as_str()).collect();
        assert!(countries.contains(&"US") && countries.contains(&"CA"));
    }

    #[test]
    fn officials_pagination_slices_and_flags() {
        let conn = test_conn();
        for id in 1..=3 {
            insert_trial(&conn, id, "ALL", 0, 120, None);
            insert_location(&conn, id, 0, "F", "C", "X");
        }
        // Alice on 3 trials, Bob on 2, Carol on 1.
        for id in 1..=3 {
            insert_official(&conn, id, "Alice", Some("Uni"), Some("PI"));
        }
        insert_official(&conn, 1, "Bob", None, None);
        insert_official(&conn, 2, "Bob", Some("Lab"), None);
        insert_official(&conn, 3, "Carol", None, Some("Chair"));

        let page1 = officials(&conn, 1, 2).unwrap();
        let names: Vec<&str> = page1.data.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
        assert_eq!(page1.pagination.total_items, 3);
        assert_eq!(page1.pagination.total_pages, 2);
        assert!(page1.pagination.has_next_page);
        assert!(!page1.pagination.has_prev_page);

        let page2 = officials(&conn, 2, 2).unwrap();
        assert_eq!(page2.data.len(), 1);
        assert_eq!(page2.data[0].name, "Carol");
        assert!(!page2.pagination.has_next_page);
        assert!(page2.pagination.has_prev_page);
    }

    #[test]
    fn officials_dedupe_and_drop_null_affiliations() {
        let conn = test_conn();
        for id in 1..=2 {
            insert_trial(&conn, id, "ALL", 0, 120, None);
            insert_location(&conn, id, 0, "F", "C", "X");
        }
        insert_official(&conn, 1, "Alice", Some("Uni"), Some("PI"));
        insert_official(&conn, 2, "Alice", Some("Uni"), None);

        let page = officials(&conn, 1, 10).unwrap();
        assert_eq!(page.data.len(), 1);
        let alice = &page.data[0];
        assert_eq!(alice.trial_count, 2);
        assert_eq!(alice.affiliations, vec!["Uni".to_string()]);
        assert_eq!(alice.roles, vec!["PI".to_string()]);
    }

    #[test]
    fn trials_by_year_filters_inclusively() {
        let conn = example_fixture();

        let all = trials_by_year(&conn, None).unwrap();
        assert_eq!(all.total_trials, 3);
        assert_eq!(all.trials.len(), 3);
        assert_eq!(all.trials[1].locations.len(), 2);

        let recent = trials_by_year(&conn, Some(2020)).unwrap();
        assert_eq!(recent.total_trials, 2);
        let ids: Vec<i64> = recent.trials.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn summary_counts_distincts_independently() {
        let conn = example_fixture();
        let s = summary_stats(&conn).unwrap();
        assert_eq!(s.total_trials, 3);
        assert_eq!(s.total_countries, 2);
        assert_eq!(s.total_cities, 2);
        assert_eq!(s.total_facilities, 2);
    }

    #[test]
    fn trials_by_ids_preserves_caller_order() {
        let conn = example_fixture();
        let hits = trials_by_ids(&conn, &[3, 1, 99]).unwrap();
        let ids: Vec<i64> = hits.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(hits[0].locations.len(), 1);
        assert_eq!(hits[0].locations[0].city, "Paris");
    }

    #[test]
    fn trials_by_ids_empty_input_is_empty() {
        let conn = example_fixture();
        assert!(trials_by_ids(&conn, &[]).unwrap().is_empty());
    }

    #[test]
    fn empty_store_yields_zeroes() {
        let conn = test_conn();
        assert!(location_distribution(&conn).unwrap().is_empty());
        let d = demographics(&conn).unwrap();
        assert_eq!(d.total_trials, 0);
        assert!(d.sex_distribution.is_empty());
        let page = officials(&conn, 1, 10).unwrap();
        assert_eq!(page.pagination.total_pages, 0);
        assert!(!page.pagination.has_next_page);
    }
}

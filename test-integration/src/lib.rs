/*!
Scénarios d'intégration du kernel Ocean.

Les tests vivent dans `tests/` et exercent le moteur complet à travers
les adaptateurs et probers scriptés de `ocean-devkit` : vagues de
commandes, propriétés de concurrence, monitoring avec anti-rebond,
planification durable.
*/
